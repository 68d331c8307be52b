//! HTTP CONNECT tunneling (RFC 9110 §9.3.6).

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Response header cap shared with the speculative path.
pub const MAX_RESPONSE_HEADER: usize = 16 * 1024;

/// Serialize the CONNECT request, including `Proxy-Authorization` when
/// credentials are present.
pub fn format_connect_request(host: &str, port: u16, auth: Option<(&str, &str)>) -> String {
    let mut req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = auth {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        req.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    req.push_str("\r\n");
    req
}

/// Send a CONNECT request and validate the proxy's response.
///
/// The read deadline applies only around the response headers; once the
/// tunnel is up the stream carries end-to-end traffic with the caller's
/// own timeouts.
pub async fn establish(
    stream: &mut TcpStream,
    connect_request: &str,
    connect_timeout: Duration,
) -> Result<()> {
    stream
        .write_all(connect_request.as_bytes())
        .await
        .map_err(|e| Error::ProxyNegotiationFailed {
            reason: format!("failed to send CONNECT: {e}"),
            status: None,
        })?;

    let response = tokio::time::timeout(connect_timeout, read_response_head(stream))
        .await
        .map_err(|_| Error::DeadlineExceeded("proxy CONNECT response"))??;

    let (status, status_line) = parse_status(&response)?;
    if status == 200 {
        Ok(())
    } else {
        Err(Error::ProxyNegotiationFailed {
            reason: format!("proxy answered {status_line:?}"),
            status: Some(status),
        })
    }
}

/// Read until the blank line ending the response head, bounded by
/// [`MAX_RESPONSE_HEADER`].
async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(Error::ProxyNegotiationFailed {
                reason: "CONNECT response headers exceed 16KB".to_string(),
                status: None,
            });
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        let n = stream.read(&mut chunk).await.map_err(|e| {
            Error::ProxyNegotiationFailed {
                reason: format!("failed to read CONNECT response: {e}"),
                status: None,
            }
        })?;
        if n == 0 {
            return Err(Error::ProxyNegotiationFailed {
                reason: "proxy closed connection during CONNECT".to_string(),
                status: None,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Extract (status code, full status line) from a response head.
pub fn parse_status(head: &[u8]) -> Result<(u16, String)> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let status_line = String::from_utf8_lossy(&head[..line_end]).into_owned();

    // "HTTP/1.1 200 Connection established"
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::ProxyNegotiationFailed {
            reason: format!("malformed CONNECT response: {status_line:?}"),
            status: None,
        });
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::ProxyNegotiationFailed {
            reason: format!("missing status in CONNECT response: {status_line:?}"),
            status: None,
        })?;
    Ok((status, status_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_shape() {
        let req = format_connect_request("example.test", 443, None);
        assert_eq!(
            req,
            "CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_with_auth() {
        let req = format_connect_request("example.test", 443, Some(("user", "pass")));
        assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn status_parsing() {
        let (status, line) = parse_status(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        assert_eq!(status, 200);
        assert_eq!(line, "HTTP/1.1 200 Connection established");

        let (status, _) = parse_status(b"HTTP/1.1 407 Proxy Auth Required\r\n\r\n").unwrap();
        assert_eq!(status, 407);

        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n").is_err());
        assert!(parse_status(b"HTTP/1.1 abc\r\n").is_err());
    }

    #[tokio::test]
    async fn establish_against_stub_proxy() {
        use tokio::io::AsyncReadExt as _;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            sock
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format_connect_request("target.test", 443, None);
        establish(&mut stream, &req, Duration::from_secs(2))
            .await
            .unwrap();
        drop(server);
    }

    #[tokio::test]
    async fn establish_surfaces_407() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format_connect_request("target.test", 443, None);
        let err = establish(&mut stream, &req, Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            Error::ProxyNegotiationFailed { status, .. } => assert_eq!(status, Some(407)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
