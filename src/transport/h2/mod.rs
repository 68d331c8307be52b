//! HTTP/2 with full preamble control.
//!
//! The h2 ecosystem crates hardcode their SETTINGS emission and pseudo-
//! header order, so the connection preamble is built by hand here: the
//! client preface, the preset's SETTINGS in declared order (plus a
//! GREASE setting for Chrome), the connection WINDOW_UPDATE and any
//! PRIORITY tree go out in a single write, matching the emulated
//! browser's first TCP segment.
//!
//! After the handshake a driver task owns the socket and multiplexes
//! streams; callers talk to it through a cloneable [`H2Handle`]. The
//! dialer never holds any pool lock across the handshake — the pool
//! reserves a placeholder and the driver is installed afterwards.

pub mod frame;
pub mod hpack;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::http2::H2Spec;
use crate::request::CancelToken;
use crate::response::Response;
use crate::transport::tls::MaybeTlsStream;
use crate::version::HttpVersion;

use frame::{flags, FrameHeader, FrameType, SettingsFrame};

/// Build the preamble bytes: preface, SETTINGS (with optional GREASE
/// entry), connection WINDOW_UPDATE, PRIORITY tree.
pub fn build_preamble(spec: &H2Spec, grease_setting: Option<(u16, u32)>) -> Bytes {
    let mut settings = SettingsFrame::new();
    for (id, value) in spec.settings {
        settings.push(*id, *value);
    }
    if let Some((id, value)) = grease_setting {
        settings.push(id, value);
    }

    let mut out = BytesMut::new();
    out.extend_from_slice(frame::CONNECTION_PREFACE);
    out.extend_from_slice(&settings.serialize());
    if spec.window_update > 0 {
        out.extend_from_slice(&frame::window_update(0, spec.window_update));
    }
    for (stream_id, depends_on, weight, exclusive) in spec.priority_preamble {
        out.extend_from_slice(&frame::priority(*stream_id, *depends_on, *weight, *exclusive));
    }
    out.freeze()
}

/// Command from a handle to the driver.
enum DriverCommand {
    SendRequest {
        method: Method,
        url: Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        response_tx: oneshot::Sender<Result<Response>>,
    },
}

/// Cloneable, non-blocking interface to a multiplexed connection.
#[derive(Clone)]
pub struct H2Handle {
    command_tx: mpsc::Sender<DriverCommand>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl H2Handle {
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Streams currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn send_request(
        &self,
        method: Method,
        url: &Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        cancel.check()?;
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::SendRequest {
                method,
                url: url.clone(),
                headers,
                body,
                response_tx,
            })
            .await
            .map_err(|_| Error::protocol("HTTP/2 driver gone"))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = tokio::select! {
            response = response_rx => match response {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::protocol("HTTP/2 stream dropped")),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Dial HTTP/2 over an established (usually TLS) stream.
///
/// Performs the preamble exchange and spawns the driver task. The
/// GREASE setting value is drawn by the caller per connection.
pub async fn dial(
    mut stream: MaybeTlsStream,
    spec: &H2Spec,
    grease_setting: Option<(u16, u32)>,
    origin: &str,
) -> Result<H2Handle> {
    let preamble = build_preamble(spec, if spec.grease_setting { grease_setting } else { None });
    stream
        .write_all(&preamble)
        .await
        .map_err(|e| Error::BodyWriteFailed { source: e })?;
    stream
        .flush()
        .await
        .map_err(|e| Error::BodyWriteFailed { source: e })?;

    let mut driver = Driver::new(stream, spec);

    // The server must answer with its own SETTINGS frame first; anything
    // else means it rejected our preface.
    let (header, payload) = driver.read_frame().await.map_err(|_| {
        Error::Http2PrefaceRejected {
            origin: origin.to_string(),
        }
    })?;
    if header.frame_type != FrameType::Settings || header.has_flag(flags::ACK) {
        return Err(Error::Http2PrefaceRejected {
            origin: origin.to_string(),
        });
    }
    driver.apply_server_settings(&payload)?;
    driver.write_all(&SettingsFrame::serialize_ack()).await?;

    let (command_tx, command_rx) = mpsc::channel(64);
    let closed = Arc::new(AtomicBool::new(false));
    let in_flight = Arc::new(AtomicUsize::new(0));

    let closed_flag = closed.clone();
    tokio::spawn(async move {
        if let Err(e) = driver.run(command_rx).await {
            tracing::debug!(error = %e, "HTTP/2 driver exited");
        }
        closed_flag.store(true, Ordering::SeqCst);
    });

    Ok(H2Handle {
        command_tx,
        closed,
        in_flight,
    })
}

/// Per-stream state held by the driver.
struct StreamState {
    response_tx: Option<oneshot::Sender<Result<Response>>>,
    url: Url,
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
    /// Bytes consumed since the last stream WINDOW_UPDATE.
    unacked: u32,
    /// Send credit granted by the peer for this stream.
    send_window: i64,
    /// Request body not yet written to the wire.
    pending_body: Bytes,
    body_offset: usize,
    end_stream_sent: bool,
}

/// The driver owns the socket: it writes requests and routes inbound
/// frames to their streams.
struct Driver {
    stream: MaybeTlsStream,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    next_stream_id: u32,
    streams: HashMap<u32, StreamState>,
    max_frame_size: u32,
    /// Server's concurrent stream limit.
    max_concurrent: u32,
    /// GOAWAY was received; streams above this ID will never complete.
    goaway_last_id: Option<u32>,
    /// Connection-level bytes consumed since the last WINDOW_UPDATE.
    conn_unacked: u32,
    /// Connection-level send credit (starts at the RFC default; only
    /// WINDOW_UPDATE on stream 0 grows it).
    conn_send_window: i64,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, seeding new stream windows.
    peer_initial_window: i64,
}

/// RFC 9113 default flow-control window.
const DEFAULT_SEND_WINDOW: i64 = 65535;

/// Send a stream/connection WINDOW_UPDATE once this many bytes are
/// consumed.
const WINDOW_UPDATE_THRESHOLD: u32 = 65536;

impl Driver {
    fn new(stream: MaybeTlsStream, spec: &H2Spec) -> Self {
        Self {
            stream,
            encoder: hpack::Encoder::new(spec.pseudo_order, spec.hpack_table_size as usize),
            decoder: hpack::Decoder::new(spec.hpack_table_size as usize),
            next_stream_id: 1,
            streams: HashMap::new(),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_concurrent: u32::MAX,
            goaway_last_id: None,
            conn_unacked: 0,
            conn_send_window: DEFAULT_SEND_WINDOW,
            peer_initial_window: DEFAULT_SEND_WINDOW,
        }
    }

    fn apply_server_settings(&mut self, payload: &[u8]) -> Result<()> {
        for (id, value) in SettingsFrame::parse_payload(payload)? {
            match id {
                0x3 => self.max_concurrent = value,
                0x4 => {
                    // RFC 9113 §6.9.2: a new INITIAL_WINDOW_SIZE moves
                    // every open stream's credit by the delta.
                    let delta = i64::from(value) - self.peer_initial_window;
                    self.peer_initial_window = i64::from(value);
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                0x5 => self.max_frame_size = value,
                _ => {}
            }
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| Error::BodyWriteFailed { source: e })?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::BodyWriteFailed { source: e })
    }

    async fn read_frame(&mut self) -> Result<(FrameHeader, Bytes)> {
        Self::read_frame_inner(&mut self.stream, self.max_frame_size).await
    }

    async fn run(mut self, mut commands: mpsc::Receiver<DriverCommand>) -> Result<()> {
        // Once all handles are gone we stop polling the channel and
        // only drain in-flight streams.
        let mut draining = false;
        loop {
            if draining && self.streams.is_empty() {
                return Ok(());
            }
            tokio::select! {
                command = commands.recv(), if !draining => {
                    match command {
                        Some(DriverCommand::SendRequest { method, url, headers, body, response_tx }) => {
                            if let Err(e) = self.start_stream(method, url, headers, body, response_tx).await {
                                // start_stream reports per-stream errors on
                                // the oneshot; an Err here is connection-fatal.
                                self.fail_all(&e);
                                return Err(e);
                            }
                        }
                        None => {
                            draining = true;
                            if self.streams.is_empty() {
                                return Ok(());
                            }
                        }
                    }
                }
                frame_result = Self::read_frame_inner(&mut self.stream, self.max_frame_size) => {
                    match frame_result {
                        Ok((header, payload)) => {
                            if let Err(e) = self.handle_frame(header, payload).await {
                                self.fail_all(&e);
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            self.fail_all(&e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    // Free-standing reader so `run` can borrow `self.streams` mutably in
    // the other select arm.
    async fn read_frame_inner(
        stream: &mut MaybeTlsStream,
        max_frame_size: u32,
    ) -> Result<(FrameHeader, Bytes)> {
        let mut head = [0u8; frame::FRAME_HEADER_SIZE];
        stream
            .read_exact(&mut head)
            .await
            .map_err(|e| Error::BodyReadFailed { source: e })?;
        let header = FrameHeader::parse(&head)?;
        if header.length > max_frame_size.max(frame::DEFAULT_MAX_FRAME_SIZE) {
            return Err(Error::protocol("peer frame exceeds max frame size"));
        }
        let mut payload = vec![0u8; header.length as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::BodyReadFailed { source: e })?;
        Ok((header, Bytes::from(payload)))
    }

    async fn start_stream(
        &mut self,
        method: Method,
        url: Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        response_tx: oneshot::Sender<Result<Response>>,
    ) -> Result<()> {
        if self.goaway_last_id.is_some() {
            let _ = response_tx.send(Err(Error::protocol("connection is shutting down (GOAWAY)")));
            return Ok(());
        }
        if self.streams.len() as u32 >= self.max_concurrent {
            let _ = response_tx.send(Err(Error::protocol("server stream limit reached")));
            return Ok(());
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let authority = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        // Connection-specific headers are illegal in HTTP/2.
        let headers: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(name, _)| {
                !matches!(
                    name.to_ascii_lowercase().as_str(),
                    "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host"
                )
            })
            .collect();

        let block = self.encoder.encode_request(
            method.as_str(),
            &authority,
            url.scheme(),
            &path,
            &headers,
        );

        let end_stream = body.is_none();
        self.write_all(&frame::headers(stream_id, &block, end_stream))
            .await?;

        self.streams.insert(
            stream_id,
            StreamState {
                response_tx: Some(response_tx),
                url,
                status: 0,
                headers: Vec::new(),
                body: BytesMut::new(),
                unacked: 0,
                send_window: self.peer_initial_window,
                pending_body: body.unwrap_or_default(),
                body_offset: 0,
                end_stream_sent: end_stream,
            },
        );
        // DATA goes out only as far as the peer's windows allow; the
        // remainder waits for WINDOW_UPDATE credit.
        self.pump_stream(stream_id).await
    }

    /// Write as much of a stream's pending body as the connection and
    /// stream send windows permit.
    async fn pump_stream(&mut self, stream_id: u32) -> Result<()> {
        loop {
            let mut out = BytesMut::new();
            {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return Ok(()); // already finished or reset
                };
                let remaining = stream.pending_body.len() - stream.body_offset;
                if remaining == 0 {
                    if !stream.end_stream_sent {
                        // Zero-length body: close the stream with an
                        // empty DATA frame.
                        out.extend_from_slice(&frame::data(stream_id, &[], true));
                        stream.end_stream_sent = true;
                    }
                } else {
                    let credit = self
                        .conn_send_window
                        .min(stream.send_window)
                        .min(i64::from(self.max_frame_size));
                    if credit <= 0 {
                        return Ok(()); // wait for WINDOW_UPDATE
                    }
                    let len = remaining.min(credit as usize);
                    let start = stream.body_offset;
                    let chunk = &stream.pending_body[start..start + len];
                    let last = start + len == stream.pending_body.len();
                    out.extend_from_slice(&frame::data(stream_id, chunk, last));
                    stream.body_offset += len;
                    stream.send_window -= len as i64;
                    self.conn_send_window -= len as i64;
                    if last {
                        stream.end_stream_sent = true;
                        // Reclaim the buffer; the upload is on the wire.
                        stream.pending_body = Bytes::new();
                        stream.body_offset = 0;
                    }
                }
            }
            if out.is_empty() {
                return Ok(());
            }
            self.write_all(&out).await?;
        }
    }

    /// Streams with body bytes still waiting on window credit.
    fn blocked_streams(&self) -> Vec<u32> {
        self.streams
            .iter()
            .filter(|(_, s)| !s.end_stream_sent)
            .map(|(id, _)| *id)
            .collect()
    }

    async fn handle_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        match header.frame_type {
            FrameType::Settings => {
                if !header.has_flag(flags::ACK) {
                    self.apply_server_settings(&payload)?;
                    self.write_all(&SettingsFrame::serialize_ack()).await?;
                    // A raised INITIAL_WINDOW_SIZE may unblock uploads.
                    for id in self.blocked_streams() {
                        self.pump_stream(id).await?;
                    }
                }
            }
            FrameType::Ping => {
                if !header.has_flag(flags::ACK) {
                    let mut data = [0u8; 8];
                    data.copy_from_slice(&payload[..8.min(payload.len())]);
                    self.write_all(&frame::ping_ack(data)).await?;
                }
            }
            FrameType::Headers => {
                let block = frame::strip_padding(&header, &payload)?;
                // Strip priority fields when the flag is set.
                let block = if header.has_flag(flags::PRIORITY) {
                    if block.len() < 5 {
                        return Err(Error::protocol("short HEADERS with PRIORITY"));
                    }
                    block.slice(5..)
                } else {
                    block
                };
                if !header.has_flag(flags::END_HEADERS) {
                    return Err(Error::protocol("CONTINUATION not supported for responses"));
                }
                let fields = self.decoder.decode(&block)?;
                if let Some(state) = self.streams.get_mut(&header.stream_id) {
                    for (name, value) in fields {
                        if name == ":status" {
                            state.status = value.parse().unwrap_or(0);
                        } else if !name.starts_with(':') {
                            state.headers.push((name, value));
                        }
                    }
                    if header.has_flag(flags::END_STREAM) {
                        self.finish_stream(header.stream_id);
                    }
                }
            }
            FrameType::Data => {
                let data = frame::strip_padding(&header, &payload)?;
                let consumed = payload.len() as u32;
                self.conn_unacked += consumed;

                let mut updates = BytesMut::new();
                if let Some(state) = self.streams.get_mut(&header.stream_id) {
                    state.body.extend_from_slice(&data);
                    state.unacked += consumed;
                    if state.unacked >= WINDOW_UPDATE_THRESHOLD
                        && !header.has_flag(flags::END_STREAM)
                    {
                        updates.extend_from_slice(&frame::window_update(
                            header.stream_id,
                            state.unacked,
                        ));
                        state.unacked = 0;
                    }
                }
                if self.conn_unacked >= WINDOW_UPDATE_THRESHOLD {
                    updates.extend_from_slice(&frame::window_update(0, self.conn_unacked));
                    self.conn_unacked = 0;
                }
                if !updates.is_empty() {
                    self.write_all(&updates).await?;
                }
                if header.has_flag(flags::END_STREAM) {
                    self.finish_stream(header.stream_id);
                }
            }
            FrameType::RstStream => {
                if let Some(mut state) = self.streams.remove(&header.stream_id) {
                    if let Some(tx) = state.response_tx.take() {
                        let _ = tx.send(Err(Error::protocol("stream reset by server")));
                    }
                }
            }
            FrameType::GoAway => {
                let (last_id, code) = frame::parse_goaway(&payload)?;
                self.goaway_last_id = Some(last_id);
                // Streams the server will never process fail now.
                let doomed: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_id)
                    .collect();
                for id in doomed {
                    if let Some(mut state) = self.streams.remove(&id) {
                        if let Some(tx) = state.response_tx.take() {
                            let _ = tx.send(Err(Error::protocol(format!(
                                "GOAWAY (error {:#x})",
                                code.0
                            ))));
                        }
                    }
                }
            }
            FrameType::PushPromise => {
                // Push is disabled in every preset; refuse any the
                // server sends anyway.
                if payload.len() >= 4 {
                    let promised =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                            & 0x7fff_ffff;
                    self.write_all(&frame::rst_stream(promised, frame::ErrorCode::REFUSED_STREAM))
                        .await?;
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() < 4 {
                    return Err(Error::protocol("short WINDOW_UPDATE payload"));
                }
                let increment = i64::from(
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7fff_ffff,
                );
                if header.stream_id == 0 {
                    self.conn_send_window += increment;
                    for id in self.blocked_streams() {
                        self.pump_stream(id).await?;
                    }
                } else {
                    if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                        stream.send_window += increment;
                    }
                    self.pump_stream(header.stream_id).await?;
                }
            }
            FrameType::Priority | FrameType::Unknown(_) => {}
            FrameType::Continuation => {
                return Err(Error::protocol("unexpected CONTINUATION"));
            }
        }
        Ok(())
    }

    fn finish_stream(&mut self, stream_id: u32) {
        if let Some(mut state) = self.streams.remove(&stream_id) {
            if let Some(tx) = state.response_tx.take() {
                let response = Response::new(
                    state.status,
                    state.headers,
                    state.body.freeze(),
                    HttpVersion::H2,
                    state.url.as_str(),
                );
                let _ = tx.send(Ok(response));
            }
        }
    }

    fn fail_all(&mut self, error: &Error) {
        for (_, mut state) in self.streams.drain() {
            if let Some(tx) = state.response_tx.take() {
                let _ = tx.send(Err(Error::protocol(format!("connection failed: {error}"))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::http2::H2Spec;

    /// Split a byte stream into (type, length, stream_id) triples.
    fn frames(mut bytes: &[u8]) -> Vec<(u8, usize, u32)> {
        let mut out = Vec::new();
        while bytes.len() >= frame::FRAME_HEADER_SIZE {
            let len = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize;
            let ty = bytes[3];
            let sid = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7fff_ffff;
            out.push((ty, len, sid));
            bytes = &bytes[frame::FRAME_HEADER_SIZE + len..];
        }
        out
    }

    #[test]
    fn chrome_preamble_fixture() {
        let preamble = build_preamble(&H2Spec::chrome(), Some((0x0a0a, 0)));
        assert!(preamble.starts_with(frame::CONNECTION_PREFACE));

        let body = &preamble[frame::CONNECTION_PREFACE.len()..];
        let layout = frames(body);
        // SETTINGS (4 real + 1 GREASE = 30 bytes) then WINDOW_UPDATE.
        assert_eq!(layout, vec![(0x4, 30, 0), (0x8, 4, 0)]);

        // The WINDOW_UPDATE increment is Chrome's 15663105.
        let wu_payload = &body[frame::FRAME_HEADER_SIZE + 30 + frame::FRAME_HEADER_SIZE..];
        assert_eq!(wu_payload, &15663105u32.to_be_bytes());

        // SETTINGS parameters in Chrome's declared order.
        let settings =
            SettingsFrame::parse_payload(&body[frame::FRAME_HEADER_SIZE..frame::FRAME_HEADER_SIZE + 30])
                .unwrap();
        assert_eq!(
            settings,
            vec![(1, 65536), (2, 0), (4, 6291456), (6, 262144), (0x0a0a, 0)]
        );
    }

    #[test]
    fn firefox_preamble_has_priority_tree() {
        let preamble = build_preamble(&H2Spec::firefox(), None);
        let body = &preamble[frame::CONNECTION_PREFACE.len()..];
        let layout = frames(body);
        // SETTINGS, WINDOW_UPDATE, then six PRIORITY frames on streams
        // 3,5,7,9,11,13.
        assert_eq!(layout.len(), 8);
        assert_eq!(layout[0].0, 0x4);
        assert_eq!(layout[1], (0x8, 4, 0));
        let priority_streams: Vec<u32> = layout[2..].iter().map(|(_, _, sid)| *sid).collect();
        assert_eq!(priority_streams, vec![3, 5, 7, 9, 11, 13]);
    }

    #[test]
    fn safari_preamble_has_no_grease_setting() {
        let spec = H2Spec::safari();
        // Grease argument is ignored for browsers that never send one.
        let preamble = build_preamble(&spec, None);
        let body = &preamble[frame::CONNECTION_PREFACE.len()..];
        let settings = SettingsFrame::parse_payload(
            &body[frame::FRAME_HEADER_SIZE..frame::FRAME_HEADER_SIZE + spec.settings.len() * 6],
        )
        .unwrap();
        assert_eq!(settings, vec![(4, 4194304), (3, 100)]);
    }
}
