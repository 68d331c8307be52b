//! HTTP/3 over quiche, running on any [`PacketConn`].
//!
//! The dialer applies the preset's QUIC transport parameters, presents
//! a cached session for resumption when one exists, and tags the first
//! request for 0-RTT when the method allows it. Because all I/O goes
//! through [`PacketConn`], the same code path serves direct UDP,
//! SOCKS5 UDP ASSOCIATE relays and MASQUE tunnels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::Method;
use quiche::h3::NameValue;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::http2::PseudoOrder;
use crate::fingerprint::http3::H3Spec;
use crate::keylog::KeyLogSink;
use crate::proxy::PacketConn;
use crate::request::CancelToken;
use crate::response::Response;
use crate::session::ticket::{TicketCache, TicketProtocol, TicketRecord};
use crate::version::HttpVersion;

const MAX_DATAGRAM_SIZE: usize = 1350;
const RECV_POLL: Duration = Duration::from_millis(25);

/// Everything that must be mutated together while driving the
/// connection.
struct H3State {
    conn: quiche::Connection,
    h3: Option<quiche::h3::Connection>,
    pconn: PacketConn,
    local: SocketAddr,
    /// Session captured after the handshake, stored once.
    session_saved: bool,
}

struct Inner {
    state: Mutex<H3State>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    origin: String,
    preset_name: &'static str,
    tickets: TicketCache,
    qpack_capacity: u64,
    qpack_blocked: u64,
    pseudo_order: PseudoOrder,
}

/// Cloneable handle onto a multiplexed HTTP/3 connection.
#[derive(Clone)]
pub struct H3Handle {
    inner: Arc<Inner>,
}

/// Adapter feeding quiche's keylog into our sink.
struct KeyLogWriter(Arc<dyn KeyLogSink>);

impl std::io::Write for KeyLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(s) = std::str::from_utf8(buf) {
            for line in s.lines().filter(|l| !l.is_empty()) {
                self.0.log_line(line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn build_config(spec: &H3Spec) -> Result<quiche::Config> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)
        .map_err(|e| Error::quic(format!("quiche config: {e}")))?;
    config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL);
    config.set_max_idle_timeout(spec.max_idle_timeout_ms);
    config.set_max_recv_udp_payload_size(65535);
    config.set_max_send_udp_payload_size(spec.max_udp_payload_size as usize);
    config.set_initial_max_data(spec.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(spec.initial_max_stream_data_bidi_local);
    config.set_initial_max_stream_data_bidi_remote(spec.initial_max_stream_data_bidi_remote);
    config.set_initial_max_stream_data_uni(spec.initial_max_stream_data_uni);
    config.set_initial_max_streams_bidi(spec.initial_max_streams_bidi);
    config.set_initial_max_streams_uni(spec.initial_max_streams_uni);
    config.set_disable_active_migration(spec.disable_active_migration);
    config.grease(spec.grease);
    config.enable_early_data();
    if spec.enable_datagrams {
        config.enable_dgram(true, 64, 64);
    }
    Ok(config)
}

/// Dial HTTP/3 to `host` over an established packet path.
///
/// When the ticket cache holds a session for (origin, preset), it is
/// presented for resumption. With `allow_early_data` the dial returns
/// as soon as quiche enters early data, so the first request rides in
/// the 0-RTT flight; the engine only sets it for idempotent methods
/// (or when the session opted into unsafe early data).
#[allow(clippy::too_many_arguments)]
pub async fn dial(
    host: &str,
    origin: String,
    mut pconn: PacketConn,
    spec: &H3Spec,
    pseudo_order: PseudoOrder,
    preset_name: &'static str,
    tickets: TicketCache,
    key_log: Option<Arc<dyn KeyLogSink>>,
    allow_early_data: bool,
    handshake_timeout: Duration,
    cancel: &CancelToken,
) -> Result<H3Handle> {
    let mut config = build_config(spec)?;

    let mut scid = [0u8; 20];
    getrandom::getrandom(&mut scid).map_err(|e| Error::quic(format!("cid entropy: {e}")))?;
    let scid = quiche::ConnectionId::from_ref(&scid);

    let local = pconn.local_addr()?;
    let peer = pconn.peer_addr();
    let mut conn = quiche::connect(Some(host), &scid, local, peer, &mut config)
        .map_err(|e| Error::quic(format!("quiche connect: {e}")))?;

    if let Some(sink) = key_log.or_else(crate::keylog::key_log_sink) {
        conn.set_keylog(Box::new(KeyLogWriter(sink)));
    }

    let resumed = match tickets.get(&origin, preset_name, TicketProtocol::H3) {
        Some(record) => match conn.set_session(&record.blob) {
            Ok(()) => {
                tracing::debug!(%origin, "presenting cached QUIC session");
                true
            }
            Err(e) => {
                tracing::debug!(%origin, error = %e, "cached QUIC session rejected");
                tickets.remove(&origin, preset_name, TicketProtocol::H3);
                false
            }
        },
        None => false,
    };

    // Handshake pump. With a resumed session quiche enters early data
    // before the handshake confirms; we exit the loop either way.
    let handshake = async {
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut buf = vec![0u8; 65535];
        loop {
            flush_egress(&mut conn, &mut pconn, &mut out).await?;
            if conn.is_established() || (resumed && allow_early_data && conn.is_in_early_data()) {
                return Ok::<(), Error>(());
            }
            if conn.is_closed() {
                return Err(Error::Http3Unavailable {
                    origin: origin.clone(),
                    reason: "QUIC connection closed during handshake".to_string(),
                });
            }
            match tokio::time::timeout(RECV_POLL, pconn.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let info = quiche::RecvInfo { from: peer, to: local };
                    if let Err(e) = conn.recv(&mut buf[..n], info) {
                        if e != quiche::Error::Done {
                            return Err(Error::quic(format!("quiche recv: {e}")));
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // quiche timers (loss detection, idle) fire here.
                    conn.on_timeout();
                }
            }
        }
    };

    tokio::select! {
        result = tokio::time::timeout(handshake_timeout, handshake) => {
            result.map_err(|_| Error::Http3Unavailable {
                origin: origin.clone(),
                reason: "QUIC handshake timed out (UDP blocked?)".to_string(),
            })??;
        }
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    }

    let inner = Arc::new(Inner {
        state: Mutex::new(H3State {
            conn,
            h3: None,
            pconn,
            local,
            session_saved: false,
        }),
        closed: AtomicBool::new(false),
        in_flight: AtomicUsize::new(0),
        origin,
        preset_name,
        tickets,
        qpack_capacity: spec.qpack_max_table_capacity,
        qpack_blocked: spec.qpack_blocked_streams,
        pseudo_order,
    });

    Ok(H3Handle { inner })
}

impl H3Handle {
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub async fn send_request(
        &self,
        method: Method,
        url: &Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.send_request_inner(method, url, headers, body, cancel).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_err() {
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn send_request_inner(
        &self,
        method: Method,
        url: &Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        cancel.check()?;
        let mut state = self.inner.state.lock().await;

        if state.h3.is_none() {
            let mut h3_config = quiche::h3::Config::new()
                .map_err(|e| Error::quic(format!("h3 config: {e}")))?;
            h3_config.set_qpack_max_table_capacity(self.inner.qpack_capacity);
            h3_config.set_qpack_blocked_streams(self.inner.qpack_blocked);
            let h3 = quiche::h3::Connection::with_transport(&mut state.conn, &h3_config)
                .map_err(|e| Error::quic(format!("h3 connection: {e}")))?;
            state.h3 = Some(h3);
        }

        let quiche_headers = build_headers(&method, url, &headers, self.inner.pseudo_order);

        let state = &mut *state;
        let h3 = state.h3.as_mut().expect("h3 connection initialized above");
        let stream_id = h3
            .send_request(&mut state.conn, &quiche_headers, body.is_none())
            .map_err(|e| Error::quic(format!("h3 send_request: {e}")))?;

        // Pump until the stream finishes. The request body rides the
        // same loop: quiche reports `Done` when flow control is out of
        // credit, and every pass through the loop (egress flushed, acks
        // received) can free more, so the remainder is retried rather
        // than dropped.
        let mut body_done = body.is_none(); // fin rode the request head
        let body = body.unwrap_or_default();
        let mut body_sent = 0usize;
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut buf = vec![0u8; 65535];
        let mut status: u16 = 0;
        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut response_body = BytesMut::new();
        let mut finished = false;

        while !finished {
            cancel.check()?;

            while !body_done {
                let h3 = state.h3.as_mut().expect("h3 connection active");
                match h3.send_body(&mut state.conn, stream_id, &body[body_sent..], true) {
                    Ok(n) => {
                        body_sent += n;
                        // quiche only applies fin once the whole slice
                        // fit, so an empty remainder means fin is out.
                        if body_sent == body.len() {
                            body_done = true;
                        }
                    }
                    // Out of stream/connection credit; pump and retry.
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(Error::quic(format!("h3 send_body: {e}"))),
                }
            }

            flush_egress(&mut state.conn, &mut state.pconn, &mut out).await?;

            loop {
                let h3 = state.h3.as_mut().expect("h3 connection active");
                match h3.poll(&mut state.conn) {
                    Ok((id, quiche::h3::Event::Headers { list, .. })) if id == stream_id => {
                        for header in &list {
                            let name = String::from_utf8_lossy(header.name());
                            let value = String::from_utf8_lossy(header.value()).into_owned();
                            if name == ":status" {
                                status = value.parse().unwrap_or(0);
                            } else if !name.starts_with(':') {
                                response_headers.push((name.into_owned(), value));
                            }
                        }
                    }
                    Ok((id, quiche::h3::Event::Data)) if id == stream_id => {
                        let mut chunk = [0u8; 16384];
                        loop {
                            let h3 = state.h3.as_mut().expect("h3 connection active");
                            match h3.recv_body(&mut state.conn, stream_id, &mut chunk) {
                                Ok(n) => response_body.extend_from_slice(&chunk[..n]),
                                Err(quiche::h3::Error::Done) => break,
                                Err(e) => {
                                    return Err(Error::quic(format!("h3 recv_body: {e}")))
                                }
                            }
                        }
                    }
                    Ok((id, quiche::h3::Event::Finished)) if id == stream_id => {
                        finished = true;
                    }
                    Ok((id, quiche::h3::Event::Reset(code))) if id == stream_id => {
                        return Err(Error::protocol(format!("HTTP/3 stream reset ({code})")));
                    }
                    Ok((_, quiche::h3::Event::GoAway { .. })) => {
                        self.inner.closed.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(Error::quic(format!("h3 poll: {e}"))),
                }
            }
            if finished {
                break;
            }

            if state.conn.is_closed() {
                return Err(Error::quic("QUIC connection closed".to_string()));
            }

            let recv = tokio::time::timeout(RECV_POLL, state.pconn.recv(&mut buf));
            tokio::select! {
                result = recv => match result {
                    Ok(Ok(n)) => {
                        let info = quiche::RecvInfo {
                            from: state.pconn.peer_addr(),
                            to: state.local,
                        };
                        if let Err(e) = state.conn.recv(&mut buf[..n], info) {
                            if e != quiche::Error::Done {
                                return Err(Error::quic(format!("quiche recv: {e}")));
                            }
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => state.conn.on_timeout(),
                },
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        // First completed exchange: persist the (possibly refreshed)
        // session for future resumption.
        if !state.session_saved {
            if let Some(session) = state.conn.session() {
                self.inner.tickets.put_record(
                    &self.inner.origin,
                    self.inner.preset_name,
                    TicketProtocol::H3,
                    TicketRecord {
                        blob: session.to_vec(),
                        expires_at: chrono::Utc::now() + chrono::Duration::hours(24),
                        max_early_data: u32::MAX,
                        ech_config: None,
                    },
                );
                state.session_saved = true;
            }
        }

        Ok(Response::new(
            status,
            response_headers,
            response_body.freeze(),
            HttpVersion::H3,
            url.as_str(),
        ))
    }
}

/// Assemble pseudo + regular headers in the preset's order.
fn build_headers(
    method: &Method,
    url: &Url,
    headers: &[(String, String)],
    pseudo_order: PseudoOrder,
) -> Vec<quiche::h3::Header> {
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

    let pseudo = [
        (":method", method.as_str().to_string()),
        (":authority", authority),
        (":scheme", url.scheme().to_string()),
        (":path", path),
    ];
    let mut out = Vec::with_capacity(4 + headers.len());
    for &i in &pseudo_order.order() {
        let (name, value) = &pseudo[i];
        out.push(quiche::h3::Header::new(name.as_bytes(), value.as_bytes()));
    }
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host"
        ) {
            continue;
        }
        out.push(quiche::h3::Header::new(lower.as_bytes(), value.as_bytes()));
    }
    out
}

async fn flush_egress(
    conn: &mut quiche::Connection,
    pconn: &mut PacketConn,
    out: &mut [u8],
) -> Result<()> {
    loop {
        match conn.send(out) {
            Ok((len, _info)) => {
                pconn.send(&out[..len]).await?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(Error::quic(format!("quiche send: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_headers_follow_preset_order() {
        let url = Url::parse("https://example.test:8443/a?b=1").unwrap();
        let headers = build_headers(&Method::GET, &url, &[], PseudoOrder::Mpas);
        let names: Vec<String> = headers
            .iter()
            .map(|h| String::from_utf8_lossy(h.name()).into_owned())
            .collect();
        assert_eq!(names, vec![":method", ":path", ":authority", ":scheme"]);

        let values: Vec<String> = headers
            .iter()
            .map(|h| String::from_utf8_lossy(h.value()).into_owned())
            .collect();
        assert_eq!(values, vec!["GET", "/a?b=1", "example.test:8443", "https"]);
    }

    #[test]
    fn connection_headers_are_dropped_and_lowercased() {
        let url = Url::parse("https://example.test/").unwrap();
        let headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("User-Agent".to_string(), "ua".to_string()),
        ];
        let built = build_headers(&Method::GET, &url, &headers, PseudoOrder::Msap);
        let names: Vec<String> = built
            .iter()
            .map(|h| String::from_utf8_lossy(h.name()).into_owned())
            .collect();
        assert!(!names.contains(&"connection".to_string()));
        assert!(names.contains(&"user-agent".to_string()));
    }

    #[test]
    fn config_builds_from_all_presets() {
        for spec in [H3Spec::chrome(), H3Spec::firefox(), H3Spec::safari()] {
            assert!(build_config(&spec).is_ok());
        }
    }
}
