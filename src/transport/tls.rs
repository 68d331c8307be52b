//! BoringSSL connector driven by a preset's [`TlsSpec`].
//!
//! BoringSSL is the same TLS stack Chrome ships, which is what makes
//! byte-faithful ClientHellos possible at all: cipher order, curve
//! order, signature algorithms, GREASE and extension permutation are
//! all configured rather than reimplemented. Session tickets flow
//! through the session's ticket cache so `refresh()` can resume with
//! PSK instead of a full handshake.

use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use boring::ssl::{
    SslConnector, SslMethod, SslSession, SslSessionCacheMode, SslVerifyMode, SslVersion,
};
use boring_sys::SSL_CTX;
use sha2::{Digest, Sha256};
use std::os::raw::c_int;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::tls::TlsSpec;
use crate::keylog;
use crate::session::ticket::{TicketCache, TicketProtocol};
use crate::transport::speculative::SpeculativeStream;

extern "C" {
    /// Enable GREASE placeholders (Chrome/Safari behavior).
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Enable per-connection extension order permutation (Chrome 110+).
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
}

/// The TCP path under TLS: direct, or a speculative CONNECT wrapper.
pub enum TcpLink {
    Plain(TcpStream),
    Speculative(SpeculativeStream<TcpStream>),
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpLink::Plain(_) => f.write_str("TcpLink::Plain"),
            TcpLink::Speculative(_) => f.write_str("TcpLink::Speculative"),
        }
    }
}

impl AsyncRead for TcpLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TcpLink::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TcpLink::Speculative(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TcpLink::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TcpLink::Speculative(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TcpLink::Plain(s) => Pin::new(s).poll_flush(cx),
            TcpLink::Speculative(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TcpLink::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TcpLink::Speculative(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A stream that is either raw TCP (http://) or TLS (https://).
pub enum MaybeTlsStream {
    Plain(TcpLink),
    Tls(Box<SslStream<TcpLink>>),
}

impl MaybeTlsStream {
    /// ALPN protocol negotiated during the handshake, if any.
    pub fn alpn(&self) -> Option<&[u8]> {
        match self {
            MaybeTlsStream::Plain(_) => None,
            MaybeTlsStream::Tls(s) => s.ssl().selected_alpn_protocol(),
        }
    }

    pub fn is_h2(&self) -> bool {
        self.alpn() == Some(b"h2")
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Which ALPN set to offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnMode {
    /// Offer the preset's full list (normally `h2, http/1.1`).
    PresetDefault,
    /// Force HTTP/1.1 only.
    H1Only,
    /// Force h2 only.
    H2Only,
}

/// Session-scoped TLS connector.
pub struct TlsConnector {
    spec: TlsSpec,
    tickets: TicketCache,
    /// "sha256/<base64 SPKI digest>" pins; empty disables pinning.
    pins: Vec<String>,
    verify_tls: bool,
    key_log: keylog::KeyLogSlot,
    preset_name: &'static str,
}

impl TlsConnector {
    pub fn new(
        spec: TlsSpec,
        preset_name: &'static str,
        tickets: TicketCache,
        pins: Vec<String>,
        verify_tls: bool,
        key_log: keylog::KeyLogSlot,
    ) -> Self {
        Self {
            spec,
            tickets,
            pins,
            verify_tls,
            key_log,
            preset_name,
        }
    }

    fn build_connector(&self, alpn: AlpnMode) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls("", format!("SSL connector init: {e}")))?;

        let spec = &self.spec;
        if !spec.cipher_list.is_empty() {
            builder
                .set_cipher_list(&spec.cipher_list.join(":"))
                .map_err(|e| Error::tls("", format!("cipher list: {e}")))?;
        }
        if !spec.curves.is_empty() {
            builder
                .set_curves_list(&spec.curves.join(":"))
                .map_err(|e| Error::tls("", format!("curves: {e}")))?;
        }
        if !spec.sigalgs.is_empty() {
            builder
                .set_sigalgs_list(&spec.sigalgs.join(":"))
                .map_err(|e| Error::tls("", format!("sigalgs: {e}")))?;
        }

        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| Error::tls("", format!("min version: {e}")))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::tls("", format!("max version: {e}")))?;

        // GREASE and extension permutation are context-level knobs the
        // safe wrapper does not expose.
        unsafe {
            let ctx = builder.as_ptr() as *mut SSL_CTX;
            SSL_CTX_set_grease_enabled(ctx, spec.grease as c_int);
            SSL_CTX_set_permute_extensions(ctx, spec.permute_extensions as c_int);
        }

        let alpn_wire = match alpn {
            AlpnMode::PresetDefault => alpn_wire_format(spec.alpn),
            AlpnMode::H1Only => alpn_wire_format(&["http/1.1"]),
            AlpnMode::H2Only => alpn_wire_format(&["h2"]),
        };
        builder
            .set_alpn_protos(&alpn_wire)
            .map_err(|e| Error::tls("", format!("ALPN: {e}")))?;

        if !self.verify_tls {
            builder.set_verify(SslVerifyMode::NONE);
        }

        // Client-side session caching feeds NewSessionTicket messages
        // into the ticket cache, keyed by SNI.
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        {
            let tickets = self.tickets.clone();
            let preset_name = self.preset_name;
            builder.set_new_session_callback(move |ssl, session| {
                let Some(host) = ssl.servername(boring::ssl::NameType::HOST_NAME) else {
                    return;
                };
                match session.to_der() {
                    Ok(der) => {
                        tickets.put(host, preset_name, TicketProtocol::H2, der);
                    }
                    Err(e) => {
                        tracing::debug!(host, error = %e, "failed to serialize TLS session");
                    }
                }
            });
        }

        if let Some(sink) = keylog::resolve_sink(&self.key_log) {
            builder.set_keylog_callback(move |_ssl, line| sink.log_line(line));
        }

        Ok(builder.build())
    }

    /// Handshake over an established TCP link.
    ///
    /// A cached session for (host, preset) is presented for PSK
    /// resumption when available; certificate pins are verified after
    /// the handshake and a mismatch is fatal.
    pub async fn handshake(
        &self,
        link: TcpLink,
        host: &str,
        alpn: AlpnMode,
    ) -> Result<SslStream<TcpLink>> {
        let speculative_failure = match &link {
            TcpLink::Speculative(s) => Some(s.failure_slot()),
            TcpLink::Plain(_) => None,
        };

        let connector = self.build_connector(alpn)?;
        let mut config = connector
            .configure()
            .map_err(|e| Error::tls(host, format!("SSL configure: {e}")))?;

        if let Some(ticket) = self.tickets.get(host, self.preset_name, TicketProtocol::H2) {
            match SslSession::from_der(&ticket.blob) {
                Ok(session) => {
                    // Safety contract: the session came from this
                    // context configuration (same preset).
                    unsafe {
                        let _ = config.set_session(&session);
                    }
                    tracing::debug!(host, "presenting cached TLS session for resumption");
                }
                Err(e) => {
                    tracing::debug!(host, error = %e, "dropping undecodable cached session");
                    self.tickets.remove(host, self.preset_name, TicketProtocol::H2);
                }
            }
        }

        let stream = tokio_boring::connect(config, host, link)
            .await
            .map_err(|e| {
                let detail = e.to_string();
                // Speculative CONNECT failures must resurface typed so
                // the engine can retry non-speculatively: check the
                // wrapper's failure slot first, then the error text.
                let recorded = speculative_failure
                    .as_ref()
                    .and_then(|slot| slot.lock().ok().and_then(|s| *s));
                if let Some((op, status)) =
                    recorded.or_else(|| parse_speculative_failure(&detail))
                {
                    return Error::SpeculativeTls {
                        op,
                        status,
                        source: None,
                    };
                }
                Error::TlsHandshakeFailed {
                    host: host.to_string(),
                    detail: detail.clone(),
                    alert: extract_alert(&detail),
                }
            })?;

        if !self.pins.is_empty() {
            verify_pins(&stream, host, &self.pins)?;
        }

        Ok(stream)
    }
}

/// ALPN protocol list in the length-prefixed wire format BoringSSL
/// expects.
fn alpn_wire_format(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

/// Recognize the speculative wrapper's failure rendering
/// ("speculative TLS status: HTTP 407") inside a handshake error. The
/// wrapper's typed payload rides an `io::Error` that BoringSSL folds
/// into its error text, so the text is the stable surface to match.
fn parse_speculative_failure(detail: &str) -> Option<(&'static str, Option<u16>)> {
    let tail = detail.split("speculative TLS ").nth(1)?;
    let op = ["write", "read", "parse", "status"]
        .into_iter()
        .find(|op| tail.starts_with(op))?;
    let status = tail
        .split("HTTP ")
        .nth(1)
        .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|s| s.parse().ok());
    Some((op, status))
}

/// Pull a TLS alert name out of a handshake error string.
fn extract_alert(detail: &str) -> Option<String> {
    const ALERTS: &[&str] = &[
        "handshake_failure",
        "inappropriate_fallback",
        "protocol_version",
        "illegal_parameter",
        "decrypt_error",
        "internal_error",
        "unrecognized_name",
    ];
    let lower = detail.to_ascii_lowercase().replace(' ', "_");
    ALERTS
        .iter()
        .find(|a| lower.contains(*a))
        .map(|a| a.to_string())
}

/// SPKI pin check (HPKP-style "sha256/<base64>" pins) over the leaf and
/// any presented intermediates.
fn verify_pins(stream: &SslStream<TcpLink>, host: &str, pins: &[String]) -> Result<()> {
    let mut digests = Vec::new();
    if let Some(chain) = stream.ssl().peer_cert_chain() {
        for cert in chain {
            if let Ok(key) = cert.public_key() {
                if let Ok(spki) = key.public_key_to_der() {
                    digests.push(format!("sha256/{}", BASE64.encode(Sha256::digest(&spki))));
                }
            }
        }
    }
    if let Some(cert) = stream.ssl().peer_certificate() {
        if let Ok(key) = cert.public_key() {
            if let Ok(spki) = key.public_key_to_der() {
                digests.push(format!("sha256/{}", BASE64.encode(Sha256::digest(&spki))));
            }
        }
    }

    if digests.iter().any(|d| pins.iter().any(|p| p == d)) {
        Ok(())
    } else {
        Err(Error::CertificatePinMismatch {
            host: host.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_wire_format_is_length_prefixed() {
        assert_eq!(alpn_wire_format(&["h2", "http/1.1"]), b"\x02h2\x08http/1.1");
        assert_eq!(alpn_wire_format(&["h3"]), b"\x02h3");
    }

    #[test]
    fn speculative_failures_recognized_in_error_text() {
        assert_eq!(
            parse_speculative_failure("handshake failed: speculative TLS status: HTTP 407"),
            Some(("status", Some(407)))
        );
        assert_eq!(
            parse_speculative_failure("speculative TLS parse failed"),
            Some(("parse", None))
        );
        assert_eq!(
            parse_speculative_failure("tlsv1 alert handshake failure"),
            None
        );
    }

    #[test]
    fn alert_extraction() {
        assert_eq!(
            extract_alert("tlsv1 alert handshake failure").as_deref(),
            Some("handshake_failure")
        );
        assert_eq!(
            extract_alert("received fatal alert: inappropriate_fallback").as_deref(),
            Some("inappropriate_fallback")
        );
        assert_eq!(extract_alert("connection reset by peer"), None);
    }
}
