//! HTTP/1.1 connection with verbatim header ordering.
//!
//! Request serialization is manual: the preset's header order must
//! survive to the wire byte-for-byte, which rules out map-backed HTTP
//! libraries. Responses are parsed with httparse plus hand-rolled body
//! framing per RFC 9112 (Content-Length, chunked, read-to-close).

use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::error::{Error, Result};
use crate::request::CancelToken;
use crate::response::Response;
use crate::transport::tls::MaybeTlsStream;
use crate::version::HttpVersion;

/// Maximum response head size.
const MAX_HEADERS_SIZE: usize = 64 * 1024;
/// Maximum parsed header count.
const MAX_HEADERS_COUNT: usize = 100;

/// An HTTP/1.1 connection. Strictly serial: one request at a time, and
/// only a fully drained response leaves the connection reusable.
pub struct H1Connection {
    stream: MaybeTlsStream,
    reusable: bool,
}

impl H1Connection {
    pub fn new(stream: MaybeTlsStream) -> Self {
        Self {
            stream,
            reusable: true,
        }
    }

    /// Whether the connection may return to the pool. False after a
    /// `Connection: close`, a framing error, or an undrained body.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub async fn send_request(
        &mut self,
        method: Method,
        url: &Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        cancel.check()?;
        let request_bytes = build_request(&method, url, &headers, body.as_deref())?;

        let io = async {
            self.stream
                .write_all(&request_bytes)
                .await
                .map_err(|e| Error::BodyWriteFailed { source: e })?;
            if let Some(body) = &body {
                self.stream
                    .write_all(body)
                    .await
                    .map_err(|e| Error::BodyWriteFailed { source: e })?;
            }
            self.stream
                .flush()
                .await
                .map_err(|e| Error::BodyWriteFailed { source: e })?;
            self.read_response(&method, url).await
        };

        tokio::select! {
            result = io => result,
            _ = cancel.cancelled() => {
                // Mid-request cancellation leaves unread bytes behind.
                self.reusable = false;
                Err(Error::Cancelled)
            }
        }
    }

    /// Read one final response, consuming 1xx interim responses.
    async fn read_response(&mut self, method: &Method, url: &Url) -> Result<Response> {
        let mut buffer: Vec<u8> = Vec::with_capacity(8 * 1024);

        loop {
            let head_end = loop {
                if let Some(end) = find_head_end(&buffer) {
                    break end;
                }
                if buffer.len() >= MAX_HEADERS_SIZE {
                    self.reusable = false;
                    return Err(Error::protocol("response headers exceed 64KB"));
                }
                let mut chunk = [0u8; 8192];
                let n = self
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| Error::BodyReadFailed { source: e })?;
                if n == 0 {
                    self.reusable = false;
                    return Err(Error::protocol("connection closed before response head"));
                }
                buffer.extend_from_slice(&chunk[..n]);
            };

            let (status, headers) = parse_head(&buffer[..head_end])?;

            // RFC 9112 §6: interim responses have no body; keep what
            // follows them in the buffer and parse again.
            if (100..200).contains(&status) {
                buffer.drain(..head_end);
                continue;
            }

            if let Some(conn) = header_value(&headers, "connection") {
                if conn.to_ascii_lowercase().contains("close") {
                    self.reusable = false;
                }
            }

            let body = self
                .read_body(status, method, &headers, buffer[head_end..].to_vec())
                .await?;

            return Ok(Response::new(
                status,
                headers,
                body,
                HttpVersion::H1,
                url.as_str(),
            ));
        }
    }

    /// Read the response body per RFC 9112 §6.3 framing rules.
    async fn read_body(
        &mut self,
        status: u16,
        method: &Method,
        headers: &[(String, String)],
        initial: Vec<u8>,
    ) -> Result<Bytes> {
        // HEAD responses and 204/304 never carry a body.
        let has_body = !matches!(status, 100..=199 | 204 | 304) && *method != Method::HEAD;
        if !has_body {
            return Ok(Bytes::new());
        }

        let transfer_encoding = header_value(headers, "transfer-encoding");
        let is_chunked = transfer_encoding
            .map(|v| {
                v.split(',')
                    .next_back()
                    .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if is_chunked {
            return self.read_chunked(initial).await;
        }

        // Transfer-Encoding present overrides Content-Length.
        if transfer_encoding.is_none() {
            if let Some(cl) = header_value(headers, "content-length") {
                let len = parse_content_length(cl)?;
                return self.read_fixed(initial, len).await;
            }
        }

        // Delimited by connection close.
        self.reusable = false;
        self.read_to_close(initial).await
    }

    async fn read_fixed(&mut self, initial: Vec<u8>, len: usize) -> Result<Bytes> {
        let mut body = initial;
        if body.len() > len {
            // Bytes beyond the declared length would belong to a next
            // response we never requested; drop the connection.
            self.reusable = false;
            body.truncate(len);
        }
        while body.len() < len {
            let mut chunk = vec![0u8; (len - body.len()).min(8192)];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::BodyReadFailed { source: e })?;
            if n == 0 {
                self.reusable = false;
                return Err(Error::protocol(format!(
                    "connection closed mid-body ({} of {len} bytes)",
                    body.len()
                )));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(Bytes::from(body))
    }

    async fn read_to_close(&mut self, initial: Vec<u8>) -> Result<Bytes> {
        let mut body = initial;
        let mut chunk = [0u8; 8192];
        loop {
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::BodyReadFailed { source: e })?;
            if n == 0 {
                return Ok(Bytes::from(body));
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_chunked(&mut self, initial: Vec<u8>) -> Result<Bytes> {
        let mut body = Vec::new();
        let mut buffer = initial;
        let mut chunk_buf = [0u8; 8192];

        loop {
            let (size, line_end) = loop {
                if let Some(parsed) = parse_chunk_size(&buffer) {
                    break parsed;
                }
                let n = self
                    .stream
                    .read(&mut chunk_buf)
                    .await
                    .map_err(|e| Error::BodyReadFailed { source: e })?;
                if n == 0 {
                    self.reusable = false;
                    return Err(Error::protocol("connection closed reading chunk size"));
                }
                buffer.extend_from_slice(&chunk_buf[..n]);
            };
            buffer.drain(..line_end);

            if size == 0 {
                self.consume_trailers(&mut buffer).await?;
                return Ok(Bytes::from(body));
            }

            let need = size + 2; // data + CRLF
            while buffer.len() < need {
                let n = self
                    .stream
                    .read(&mut chunk_buf)
                    .await
                    .map_err(|e| Error::BodyReadFailed { source: e })?;
                if n == 0 {
                    self.reusable = false;
                    return Err(Error::protocol("connection closed mid-chunk"));
                }
                buffer.extend_from_slice(&chunk_buf[..n]);
            }
            body.extend_from_slice(&buffer[..size]);
            buffer.drain(..need);
        }
    }

    /// Consume trailer fields up to and including the blank line.
    async fn consume_trailers(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = find_crlf(buffer) {
                if pos == 0 {
                    buffer.drain(..2);
                    return Ok(());
                }
                buffer.drain(..pos + 2);
                continue;
            }
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::BodyReadFailed { source: e })?;
            if n == 0 {
                // Trailers absent at close; acceptable.
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Serialize the request head + ordered headers.
///
/// `Host` goes first (Chrome's HTTP/1.1 order), then the template
/// headers exactly as given. A `Content-Length` is appended only when a
/// body is present and the caller didn't frame it explicitly.
fn build_request(
    method: &Method,
    url: &Url,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<Vec<u8>> {
    for (name, value) in headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    let path = url.path();
    out.extend_from_slice(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(query) = url.query() {
        out.push(b'?');
        out.extend_from_slice(query.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(url.host_str().unwrap_or_default().as_bytes());
    if let Some(port) = url.port() {
        out.extend_from_slice(format!(":{port}").as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    let mut has_connection = false;
    let mut has_content_length = false;
    let mut has_transfer_encoding = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            continue; // already emitted first
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            has_transfer_encoding = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !has_connection {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    if let Some(body) = body {
        if !has_content_length && !has_transfer_encoding {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

fn parse_head(head: &[u8]) -> Result<(u16, Vec<(String, String)>)> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed
        .parse(head)
        .map_err(|e| Error::protocol(format!("response parse: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::protocol("incomplete response head")),
    }
    let status = parsed
        .code
        .ok_or_else(|| Error::protocol("missing status code"))?;
    let headers = parsed
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();
    Ok((status, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse a chunk-size line, returning (size, bytes consumed including
/// CRLF). Chunk extensions are ignored.
fn parse_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_crlf(buffer)?;
    let line = std::str::from_utf8(&buffer[..crlf]).ok()?;
    let size_part = line.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, crlf + 2))
}

/// Content-Length per RFC 9112 §6.2: non-negative; repeated values must
/// agree.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parts = value.split(',').map(str::trim);
    let first = parts
        .next()
        .unwrap_or_default()
        .parse::<usize>()
        .map_err(|_| Error::protocol(format!("invalid Content-Length: {value}")))?;
    for part in parts {
        let v = part
            .parse::<usize>()
            .map_err(|_| Error::protocol(format!("invalid Content-Length: {value}")))?;
        if v != first {
            return Err(Error::protocol(format!(
                "conflicting Content-Length values: {value}"
            )));
        }
    }
    Ok(first)
}

/// RFC 9110 token check for header names.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(Error::protocol(format!("invalid header name: {name:?}")));
    }
    Ok(())
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Reject CR/LF/NUL in values (header injection).
fn validate_header_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Error::protocol("CR/LF/NUL in header value"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn request_preserves_header_order() {
        let headers = vec![
            ("sec-ch-ua".to_string(), "\"X\";v=\"1\"".to_string()),
            ("User-Agent".to_string(), "agent".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];

        let bytes = build_request(
            &Method::GET,
            &url("https://example.test/path?q=1"),
            &headers,
            None,
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "GET /path?q=1 HTTP/1.1");
        assert_eq!(lines[1], "Host: example.test");
        assert_eq!(lines[2], "sec-ch-ua: \"X\";v=\"1\"");
        assert_eq!(lines[3], "User-Agent: agent");
        assert_eq!(lines[4], "Accept: */*");
    }

    #[test]
    fn content_length_added_for_bodies() {
        let bytes = build_request(
            &Method::POST,
            &url("https://example.test/submit"),
            &[],
            Some(b"field=value"),
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 11\r\n"));
    }

    #[test]
    fn explicit_transfer_encoding_suppresses_content_length() {
        let headers = vec![("Transfer-Encoding".to_string(), "chunked".to_string())];
        let bytes = build_request(
            &Method::POST,
            &url("https://example.test/"),
            &headers,
            Some(b"ignored"),
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn header_injection_rejected() {
        let headers = vec![(
            "X-Evil".to_string(),
            "value\r\nInjected: yes".to_string(),
        )];
        assert!(build_request(&Method::GET, &url("https://a.test/"), &headers, None).is_err());

        let headers = vec![("Bad Name".to_string(), "v".to_string())];
        assert!(build_request(&Method::GET, &url("https://a.test/"), &headers, None).is_err());
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"5\r\nhello"), Some((5, 3)));
        assert_eq!(parse_chunk_size(b"a\r\n"), Some((10, 3)));
        assert_eq!(parse_chunk_size(b"FF\r\n"), Some((255, 4)));
        assert_eq!(parse_chunk_size(b"5;ext=v\r\ndata"), Some((5, 9)));
        assert_eq!(parse_chunk_size(b"0\r\n"), Some((0, 3)));
        assert_eq!(parse_chunk_size(b"XYZ\r\n"), None);
        assert_eq!(parse_chunk_size(b"5"), None);
    }

    #[test]
    fn content_length_validation() {
        assert_eq!(parse_content_length("100").unwrap(), 100);
        assert_eq!(parse_content_length("100, 100").unwrap(), 100);
        assert!(parse_content_length("100, 200").is_err());
        assert!(parse_content_length("abc").is_err());
        assert!(parse_content_length("-1").is_err());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(
            find_head_end(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"),
            Some(38)
        );
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn parse_head_extracts_headers_in_order() {
        let (status, headers) =
            parse_head(b"HTTP/1.1 301 Moved\r\nLocation: /next\r\nSet-Cookie: a=1\r\n\r\n").unwrap();
        assert_eq!(status, 301);
        assert_eq!(headers[0], ("Location".to_string(), "/next".to_string()));
        assert_eq!(headers[1], ("Set-Cookie".to_string(), "a=1".to_string()));
    }
}
