//! Speculative TLS over HTTP CONNECT.
//!
//! Normal proxy flow costs a round trip: send CONNECT, wait for
//! `200 Connection established`, then start TLS. The speculative flow
//! coalesces the CONNECT request with the TLS ClientHello in a single
//! TCP send; on the read side the proxy's HTTP response head is parsed,
//! validated and stripped before TLS sees any bytes. The proxy buffers
//! the ClientHello until the tunnel is up, which is plain TCP behavior
//! and works with every CONNECT proxy we have tested against.
//!
//! A non-200 response surfaces as a typed I/O error that the dialer
//! converts to [`crate::error::Error::SpeculativeTls`]; the engine then
//! retries once with speculation disabled for that (proxy, protocol).

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::proxy::connect::parse_status;

/// Header accumulation cap while waiting for the proxy response.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Error payload carried through the `std::io::Error` the poll traits
/// force on us. The dialer downcasts it back into a typed error.
#[derive(Debug)]
pub struct SpeculativeIoError {
    pub op: &'static str,
    pub status: Option<u16>,
}

impl std::fmt::Display for SpeculativeIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "speculative TLS {}: HTTP {}", self.op, status),
            None => write!(f, "speculative TLS {} failed", self.op),
        }
    }
}

impl std::error::Error for SpeculativeIoError {}

/// Extract a speculative error from an I/O error, if it carries one.
pub fn speculative_error(err: &io::Error) -> Option<&SpeculativeIoError> {
    err.get_ref()?.downcast_ref::<SpeculativeIoError>()
}

fn speculative_io(op: &'static str, status: Option<u16>) -> io::Error {
    io::Error::other(SpeculativeIoError { op, status })
}

/// Shared slot recording the stream's failure, readable after the TLS
/// layer has swallowed the underlying `io::Error`.
pub type FailureSlot = Arc<Mutex<Option<(&'static str, Option<u16>)>>>;

enum WriteState {
    /// CONNECT not yet sent; the next write coalesces it.
    Pending(Vec<u8>),
    /// Mid-flush of the combined buffer: (buffer, written so far,
    /// caller byte count to report on completion).
    Flushing(Vec<u8>, usize, usize),
    /// CONNECT is on the wire; writes pass through.
    Done,
}

enum ReadState {
    /// Accumulating the proxy's HTTP response head.
    StrippingResponse(Vec<u8>),
    /// Leftover TLS bytes that arrived with the response head.
    Buffered(Vec<u8>, usize),
    /// Response stripped; reads pass through.
    Done,
}

/// Stream wrapper implementing the speculative CONNECT exchange.
///
/// Wraps the raw proxy TCP stream; the TLS handshake runs directly on
/// top of this type, never seeing the HTTP framing.
pub struct SpeculativeStream<S> {
    inner: S,
    write: WriteState,
    read: ReadState,
    failure: FailureSlot,
}

impl<S> std::fmt::Debug for SpeculativeStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SpeculativeStream")
    }
}

impl<S> SpeculativeStream<S> {
    /// `connect_request` must be a complete CONNECT request including
    /// the terminating blank line.
    pub fn new(inner: S, connect_request: String) -> Self {
        Self {
            inner,
            write: WriteState::Pending(connect_request.into_bytes()),
            read: ReadState::StrippingResponse(Vec::with_capacity(256)),
            failure: FailureSlot::default(),
        }
    }

    /// Handle onto the failure record; survives the stream being moved
    /// into (and consumed by) a failed TLS handshake.
    pub fn failure_slot(&self) -> FailureSlot {
        self.failure.clone()
    }

    fn fail(&self, op: &'static str, status: Option<u16>) -> io::Error {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = Some((op, status));
        }
        speculative_io(op, status)
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SpeculativeStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        loop {
            match &mut this.write {
                WriteState::Pending(request) => {
                    // First write carries the ClientHello: emit
                    // CONNECT + hello as one buffer so they share a
                    // TCP segment where possible.
                    let mut combined = std::mem::take(request);
                    combined.extend_from_slice(buf);
                    this.write = WriteState::Flushing(combined, 0, buf.len());
                }
                WriteState::Flushing(combined, written, caller_len) => {
                    while *written < combined.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &combined[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(this.fail("write", None)));
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let reported = *caller_len;
                    this.write = WriteState::Done;
                    return Poll::Ready(Ok(reported));
                }
                WriteState::Done => return Pin::new(&mut this.inner).poll_write(cx, buf),
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SpeculativeStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.read {
                ReadState::Done => return Pin::new(&mut this.inner).poll_read(cx, buf),
                ReadState::Buffered(bytes, offset) => {
                    let remaining = &bytes[*offset..];
                    let n = remaining.len().min(buf.remaining());
                    buf.put_slice(&remaining[..n]);
                    *offset += n;
                    if *offset == bytes.len() {
                        this.read = ReadState::Done;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::StrippingResponse(acc) => {
                    // Iterative accumulation: read, look for the blank
                    // line, loop. Never recurses.
                    let mut tmp = [0u8; 8192];
                    let mut tmp_buf = ReadBuf::new(&mut tmp);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {
                            let filled = tmp_buf.filled();
                            if filled.is_empty() {
                                return Poll::Ready(Err(this.fail("read", None)));
                            }
                            acc.extend_from_slice(filled);

                            if let Some(header_end) =
                                acc.windows(4).position(|w| w == b"\r\n\r\n")
                            {
                                let body_start = header_end + 4;
                                let parsed = parse_status(&acc[..body_start]);
                                let Ok((status, _line)) = parsed else {
                                    return Poll::Ready(Err(this.fail("parse", None)));
                                };
                                if status != 200 {
                                    return Poll::Ready(Err(this.fail("status", Some(status))));
                                }
                                let leftover = acc[body_start..].to_vec();
                                this.read = if leftover.is_empty() {
                                    ReadState::Done
                                } else {
                                    ReadState::Buffered(leftover, 0)
                                };
                                continue;
                            }

                            if acc.len() > MAX_HEADER_BYTES {
                                return Poll::Ready(Err(this.fail("parse", None)));
                            }
                            // Head incomplete: loop and read more.
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Run a fake proxy that answers `response` after seeing the
    /// CONNECT-prefixed first segment, then echoes `payload`.
    async fn exchange(
        response: &'static [u8],
        payload: &'static [u8],
    ) -> (io::Result<Vec<u8>>, Vec<u8>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            // Read until the CONNECT head plus hello arrive.
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                received.extend_from_slice(&chunk[..n]);
                if received.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(response).await.unwrap();
            sock.write_all(payload).await.unwrap();
            received
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut spec = SpeculativeStream::new(
            stream,
            "CONNECT target.test:443 HTTP/1.1\r\nHost: target.test:443\r\n\r\n".to_string(),
        );

        let client_result: io::Result<Vec<u8>> = async {
            spec.write_all(b"\x16\x03\x01fake-client-hello").await?;
            let mut out = vec![0u8; payload.len().max(1)];
            let mut read = 0;
            while read < payload.len() {
                let n = spec.read(&mut out[read..]).await?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            out.truncate(read);
            Ok(out)
        }
        .await;

        let server_saw = server.await.unwrap();
        (client_result, server_saw)
    }

    #[tokio::test]
    async fn strips_200_and_returns_tls_bytes() {
        let (result, server_saw) = exchange(
            b"HTTP/1.1 200 Connection established\r\n\r\n",
            b"\x16\x03\x03server-hello",
        )
        .await;
        assert_eq!(result.unwrap(), b"\x16\x03\x03server-hello");

        // CONNECT head and ClientHello left in one coalesced send.
        let text = String::from_utf8_lossy(&server_saw);
        assert!(text.starts_with("CONNECT target.test:443 HTTP/1.1\r\n"));
        assert!(server_saw.windows(4).any(|w| w == b"\r\n\r\n"));
        let head_end = server_saw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&server_saw[head_end..head_end + 3], b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn non_200_surfaces_typed_status_error() {
        let (result, _) = exchange(b"HTTP/1.1 407 Proxy Auth Required\r\n\r\n", b"").await;
        let err = result.unwrap_err();
        let spec = speculative_error(&err).expect("should carry SpeculativeIoError");
        assert_eq!(spec.op, "status");
        assert_eq!(spec.status, Some(407));
    }

    #[tokio::test]
    async fn garbage_response_is_a_parse_error() {
        let (result, _) = exchange(b"SSH-2.0-OpenSSH_9.6\r\n\r\n", b"").await;
        let err = result.unwrap_err();
        let spec = speculative_error(&err).expect("should carry SpeculativeIoError");
        assert_eq!(spec.op, "parse");
    }

    #[tokio::test]
    async fn split_response_head_is_reassembled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 4096];
            let _ = sock.read(&mut chunk).await.unwrap();
            // Drip the response head across three writes.
            sock.write_all(b"HTTP/1.1 200 Conn").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            sock.write_all(b"ection established\r\n").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            sock.write_all(b"\r\ntls-bytes").await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut spec = SpeculativeStream::new(stream, "CONNECT t:443 HTTP/1.1\r\n\r\n".to_string());
        spec.write_all(b"hello").await.unwrap();
        let mut out = [0u8; 9];
        spec.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"tls-bytes");
    }
}
