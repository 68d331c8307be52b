//! Full-stack HTTP/1.1 tests against a loopback stub server: header
//! order on the wire, cookie capture and re-emission, redirects and
//! status-based retries.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wraith::{HttpVersion, Session};

/// Serve scripted responses; records each request head.
async fn scripted_server(
    listener: TcpListener,
    responses: Vec<&'static str>,
    log: Arc<Mutex<Vec<String>>>,
) {
    let mut responses = responses.into_iter();
    'conn: loop {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        loop {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            // Read one request head (no request bodies in these tests).
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match sock.read(&mut byte).await {
                    Ok(0) => continue 'conn,
                    Ok(_) => head.push(byte[0]),
                    Err(_) => continue 'conn,
                }
            }
            log.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&head).into_owned());

            let Some(response) = responses.next() else {
                return;
            };
            if sock.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

async fn start(responses: Vec<&'static str>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(scripted_server(listener, responses, log.clone()));
    (format!("http://127.0.0.1:{}", addr.port()), log)
}

#[tokio::test]
async fn get_with_template_headers_in_order() {
    let (base, log) = start(vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    ])
    .await;

    let session = Session::new("chrome-143-linux").unwrap();
    let mut response = session.get(&format!("{base}/page")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.protocol, HttpVersion::H1);
    assert_eq!(response.text().await.unwrap(), "ok");

    let requests = log.lock().unwrap();
    let head = &requests[0];
    assert!(head.starts_with("GET /page HTTP/1.1\r\n"));

    // Template order: client hints lead, then UIR, UA, Accept, the
    // Sec-Fetch block, encodings. Host is always first.
    let order: Vec<&str> = head
        .lines()
        .skip(1)
        .filter_map(|l| l.split(':').next())
        .collect();
    let pos = |name: &str| order.iter().position(|h| h.eq_ignore_ascii_case(name));
    assert_eq!(pos("Host"), Some(0));
    assert!(pos("sec-ch-ua").unwrap() < pos("User-Agent").unwrap());
    assert!(pos("Upgrade-Insecure-Requests").unwrap() < pos("User-Agent").unwrap());
    assert!(pos("User-Agent").unwrap() < pos("Accept").unwrap());
    assert!(pos("Accept").unwrap() < pos("Sec-Fetch-Site").unwrap());
    assert!(pos("Sec-Fetch-Site").unwrap() < pos("Sec-Fetch-Mode").unwrap());
    assert!(pos("Accept-Encoding").unwrap() < pos("Accept-Language").unwrap());
    // Navigation context markers.
    assert!(head.contains("Sec-Fetch-Mode: navigate\r\n"));
    assert!(head.contains("Sec-Fetch-User: ?1\r\n"));

    session.close().await;
}

#[tokio::test]
async fn set_cookie_round_trip_and_order() {
    let (base, log) = start(vec![
        // Two cookies, one deep path and one broad.
        "HTTP/1.1 200 OK\r\nSet-Cookie: broad=1; Path=/\r\nSet-Cookie: deep=2; Path=/app/x\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    ])
    .await;

    let session = Session::new("chrome-143-linux").unwrap();
    session.get(&format!("{base}/app/x/login")).await.unwrap();
    session.get(&format!("{base}/app/x/account")).await.unwrap();

    let requests = log.lock().unwrap();
    assert!(!requests[0].contains("Cookie:"));
    // Longest path first, Cookie as the final header.
    let cookie_line = requests[1]
        .lines()
        .find(|l| l.starts_with("Cookie: "))
        .expect("second request should carry cookies");
    assert_eq!(cookie_line, "Cookie: deep=2; broad=1");
    let last_header = requests[1]
        .trim_end()
        .lines()
        .last()
        .unwrap();
    assert!(last_header.starts_with("Cookie: "));

    session.close().await;
}

#[tokio::test]
async fn redirects_followed_with_history_and_referer() {
    let (base, log) = start(vec![
        "HTTP/1.1 302 Found\r\nLocation: /landed\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
    ])
    .await;

    let session = Session::new("chrome-143-linux").unwrap();
    let mut response = session.get(&format!("{base}/start")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text().await.unwrap(), "done");
    assert!(response.final_url.ends_with("/landed"));
    assert_eq!(response.redirect_history.len(), 1);
    assert!(response.redirect_history[0].ends_with("/start"));

    let requests = log.lock().unwrap();
    assert!(requests[1].starts_with("GET /landed HTTP/1.1\r\n"));
    // The redirect hop carries the original page as Referer and is no
    // longer marked user-triggered.
    assert!(requests[1].contains("Referer: "));
    assert!(!requests[1].contains("Sec-Fetch-User"));

    session.close().await;
}

#[tokio::test]
async fn retriable_status_is_retried_for_idempotent_methods() {
    let (base, log) = start(vec![
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfresh",
    ])
    .await;

    let session = Session::new("chrome-143-linux").unwrap();
    let mut response = session.get(&format!("{base}/flaky")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text().await.unwrap(), "fresh");
    assert_eq!(log.lock().unwrap().len(), 2);

    session.close().await;
}

#[tokio::test]
async fn post_is_not_retried_on_503() {
    let (base, log) = start(vec![
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    ])
    .await;

    let session = Session::new("chrome-143-linux").unwrap();
    let response = session
        .post(&format!("{base}/submit"), "payload")
        .await
        .unwrap();
    // Non-idempotent: the 503 is the caller's answer.
    assert_eq!(response.status, 503);
    assert_eq!(log.lock().unwrap().len(), 1);

    session.close().await;
}

#[tokio::test]
async fn chunked_response_bodies_are_reassembled() {
    let (base, _log) = start(vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n",
    ])
    .await;

    let session = Session::new("firefox-133").unwrap();
    let mut response = session.get(&format!("{base}/chunked")).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello, world");

    session.close().await;
}

#[tokio::test]
async fn tls_only_mode_suppresses_template() {
    let (base, log) = start(vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    ])
    .await;

    let session = Session::builder("chrome-143-linux")
        .tls_only(true)
        .build()
        .unwrap();
    let request = wraith::Request::get(&format!("{base}/"))
        .unwrap()
        .header("X-Upstream", "browser");
    session.request(request).await.unwrap();

    let requests = log.lock().unwrap();
    let head = &requests[0];
    assert!(head.contains("X-Upstream: browser\r\n"));
    // No template headers leak in.
    assert!(!head.contains("User-Agent"));
    assert!(!head.contains("Sec-Fetch"));
    assert!(!head.contains("sec-ch-ua"));

    session.close().await;
}
