//! HTTP/2 wire tests: the preamble a server actually observes, and a
//! full request/response exchange against a scripted frame-level
//! server built from the crate's own codec.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use wraith::fingerprint::http2::H2Spec;
use wraith::request::CancelToken;
use wraith::transport::h2::{self, frame, hpack};
use wraith::transport::tls::{MaybeTlsStream, TcpLink};

async fn read_frame(sock: &mut TcpStream) -> (frame::FrameHeader, Vec<u8>) {
    let mut head = [0u8; frame::FRAME_HEADER_SIZE];
    sock.read_exact(&mut head).await.unwrap();
    let header = frame::FrameHeader::parse(&head).unwrap();
    let mut payload = vec![0u8; header.length as usize];
    sock.read_exact(&mut payload).await.unwrap();
    (header, payload)
}

/// HPACK literal-without-indexing field with a literal name.
fn literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x00, name.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

#[tokio::test]
async fn chrome_preamble_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut preface = [0u8; 24];
        sock.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface, frame::CONNECTION_PREFACE);

        // First frame: SETTINGS with Chrome's four parameters plus one
        // GREASE entry, in declared order.
        let (header, payload) = read_frame(&mut sock).await;
        assert_eq!(u8::from(header.frame_type), 0x4);
        let settings = frame::SettingsFrame::parse_payload(&payload).unwrap();
        assert_eq!(settings.len(), 5);
        assert_eq!(&settings[..4], &[(1, 65536), (2, 0), (4, 6291456), (6, 262144)]);
        // GREASE id is 0xNaNa-shaped, value 0.
        let (grease_id, grease_value) = settings[4];
        assert_eq!(grease_id & 0x0f0f, 0x0a0a);
        assert_eq!(grease_value, 0);

        // Second frame: connection WINDOW_UPDATE of 15663105.
        let (header, payload) = read_frame(&mut sock).await;
        assert_eq!(u8::from(header.frame_type), 0x8);
        assert_eq!(payload, 15663105u32.to_be_bytes());

        // Answer with empty server SETTINGS; expect the client ACK.
        sock.write_all(&frame::SettingsFrame::new().serialize())
            .await
            .unwrap();
        let (header, _) = read_frame(&mut sock).await;
        assert_eq!(u8::from(header.frame_type), 0x4);
        assert!(header.has_flag(frame::flags::ACK));
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let _handle = h2::dial(
        MaybeTlsStream::Plain(TcpLink::Plain(stream)),
        &H2Spec::chrome(),
        Some((0x2a2a, 0)),
        "127.0.0.1:0",
    )
    .await
    .unwrap();

    // The server side holds the assertions; a completed join means the
    // preamble looked exactly like Chrome's.
    server.await.unwrap();
}

#[tokio::test]
async fn request_response_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut preface = [0u8; 24];
        sock.read_exact(&mut preface).await.unwrap();

        // Consume the client preamble (SETTINGS + WINDOW_UPDATE),
        // answer SETTINGS, then wait for the request HEADERS.
        let _ = read_frame(&mut sock).await;
        let _ = read_frame(&mut sock).await;
        sock.write_all(&frame::SettingsFrame::new().serialize())
            .await
            .unwrap();

        let mut decoder = hpack::Decoder::new(65536);
        let request_fields;
        let stream_id;
        loop {
            let (header, payload) = read_frame(&mut sock).await;
            match u8::from(header.frame_type) {
                0x1 => {
                    stream_id = header.stream_id;
                    request_fields = decoder.decode(&payload).unwrap();
                    break;
                }
                _ => continue, // SETTINGS ack etc.
            }
        }

        // Chrome pseudo order: m, s, a, p.
        let names: Vec<&str> = request_fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(&names[..4], &[":method", ":scheme", ":authority", ":path"]);
        assert!(names.contains(&"user-agent"));
        let path = &request_fields[3].1;
        assert_eq!(path, "/resource?q=1");

        // Respond: HEADERS (:status 200 indexed + one literal), then
        // DATA with END_STREAM.
        let mut block = vec![0x88];
        block.extend_from_slice(&literal("content-type", "text/plain"));
        sock.write_all(&frame::headers(stream_id, &block, false))
            .await
            .unwrap();
        sock.write_all(&frame::data(stream_id, b"hello h2", true))
            .await
            .unwrap();

        // Keep the socket open until the client is done reading.
        let mut buf = [0u8; 64];
        let _ = sock.read(&mut buf).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let handle = h2::dial(
        MaybeTlsStream::Plain(TcpLink::Plain(stream)),
        &H2Spec::chrome(),
        None,
        "example.test:443",
    )
    .await
    .unwrap();

    let url = Url::parse("https://example.test/resource?q=1").unwrap();
    let headers = vec![("User-Agent".to_string(), "test-agent".to_string())];

    let mut response = handle
        .send_request(http::Method::GET, &url, headers, None, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.text().await.unwrap(), "hello h2");

    server.await.unwrap();
}

#[tokio::test]
async fn upload_respects_peer_flow_control_window() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    const WINDOW: u32 = 4;
    let payload = b"twelve-bytes";

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut preface = [0u8; 24];
        sock.read_exact(&mut preface).await.unwrap();
        let _ = read_frame(&mut sock).await; // client SETTINGS
        let _ = read_frame(&mut sock).await; // client WINDOW_UPDATE

        // Advertise a tiny per-stream window before any stream opens.
        let mut settings = frame::SettingsFrame::new();
        settings.push(0x4, WINDOW);
        sock.write_all(&settings.serialize()).await.unwrap();

        let mut received = Vec::new();
        let mut stream_id = 0;
        loop {
            let (header, frame_payload) = read_frame(&mut sock).await;
            match u8::from(header.frame_type) {
                0x1 => stream_id = header.stream_id,
                0x0 => {
                    // No DATA frame may exceed the granted credit.
                    assert!(
                        frame_payload.len() as u32 <= WINDOW,
                        "DATA of {} bytes exceeds the {WINDOW}-byte window",
                        frame_payload.len()
                    );
                    received.extend_from_slice(&frame_payload);
                    if header.has_flag(frame::flags::END_STREAM) {
                        break;
                    }
                    // Grant credit for the next chunk.
                    sock.write_all(&frame::window_update(stream_id, WINDOW))
                        .await
                        .unwrap();
                }
                _ => continue, // SETTINGS ack etc.
            }
        }
        assert_eq!(received, payload);

        // Answer so the client's request completes.
        sock.write_all(&frame::headers(stream_id, &[0x88], false))
            .await
            .unwrap();
        sock.write_all(&frame::data(stream_id, b"ok", true))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let _ = sock.read(&mut buf).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let handle = h2::dial(
        MaybeTlsStream::Plain(TcpLink::Plain(stream)),
        &H2Spec::chrome(),
        None,
        "example.test:443",
    )
    .await
    .unwrap();

    let url = Url::parse("https://example.test/upload").unwrap();
    let response = handle
        .send_request(
            http::Method::POST,
            &url,
            vec![],
            Some(bytes::Bytes::from_static(payload)),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    server.await.unwrap();
}

#[tokio::test]
async fn firefox_priority_preamble_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut preface = [0u8; 24];
        sock.read_exact(&mut preface).await.unwrap();

        let (header, payload) = read_frame(&mut sock).await;
        assert_eq!(u8::from(header.frame_type), 0x4);
        let settings = frame::SettingsFrame::parse_payload(&payload).unwrap();
        // Firefox: no GREASE entries, exactly the declared four.
        assert_eq!(
            settings,
            vec![(1, 65536), (2, 0), (4, 131072), (5, 16384)]
        );

        let (header, payload) = read_frame(&mut sock).await;
        assert_eq!(u8::from(header.frame_type), 0x8);
        assert_eq!(payload, 12517377u32.to_be_bytes());

        // The six-stream priority tree follows.
        let mut priority_streams = Vec::new();
        for _ in 0..6 {
            let (header, _) = read_frame(&mut sock).await;
            assert_eq!(u8::from(header.frame_type), 0x2);
            priority_streams.push(header.stream_id);
        }
        assert_eq!(priority_streams, vec![3, 5, 7, 9, 11, 13]);

        sock.write_all(&frame::SettingsFrame::new().serialize())
            .await
            .unwrap();
        let _ = read_frame(&mut sock).await; // ack
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let _handle = h2::dial(
        MaybeTlsStream::Plain(TcpLink::Plain(stream)),
        &H2Spec::firefox(),
        None,
        "127.0.0.1:0",
    )
    .await
    .unwrap();

    server.await.unwrap();
}
