//! Error types for the wraith crate.
//!
//! Every failure carries the operation that produced it and, where one
//! exists, the underlying cause. The request engine consults
//! [`Error::retriability`] to decide whether an attempt may be repeated;
//! everything else is surfaced to the caller verbatim.

use std::io;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the request engine may react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriability {
    /// Safe to retry (next address, next attempt, or after backoff).
    Retriable,
    /// Must not be retried; surface to the caller.
    Fatal,
    /// The server appears to have rejected the handshake itself; the
    /// configured preset may not match what the origin expects.
    FingerprintSuspect,
}

/// Errors that can occur during HTTP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS resolution failed for a host.
    #[error("DNS resolution failed for {host}")]
    DnsFailed {
        host: String,
        #[source]
        source: io::Error,
    },

    /// TCP connect to an address failed.
    #[error("TCP dial to {addr} failed")]
    DialTcpFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// UDP socket setup or send failed.
    #[error("UDP dial to {addr} failed")]
    DialUdpFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Proxy refused or failed the tunnel negotiation.
    #[error("proxy negotiation failed: {reason}{}", status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    ProxyNegotiationFailed {
        reason: String,
        /// HTTP status for CONNECT proxies, None for SOCKS5.
        status: Option<u16>,
    },

    /// TLS handshake failed.
    #[error("TLS handshake with {host} failed: {detail}")]
    TlsHandshakeFailed {
        host: String,
        detail: String,
        /// TLS alert description, when the peer sent one.
        alert: Option<String>,
    },

    /// The peer certificate did not match a configured pin.
    #[error("certificate pin mismatch for {host}")]
    CertificatePinMismatch { host: String },

    /// Server rejected our HTTP/2 connection preface.
    #[error("HTTP/2 preface rejected by {origin}")]
    Http2PrefaceRejected { origin: String },

    /// HTTP/3 could not be established (UDP blocked, handshake timeout).
    #[error("HTTP/3 unavailable for {origin}: {reason}")]
    Http3Unavailable { origin: String, reason: String },

    /// A speculative CONNECT + ClientHello exchange failed.
    /// `op` is one of "write", "read", "parse", "status".
    #[error("speculative TLS {op}{}", status.map(|s| format!(": HTTP {}", s)).unwrap_or_default())]
    SpeculativeTls {
        op: &'static str,
        status: Option<u16>,
        #[source]
        source: Option<io::Error>,
    },

    /// Server returned an HTTP error status that was configured to fail.
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    /// Failed to write the request body.
    #[error("request body write failed")]
    BodyWriteFailed {
        #[source]
        source: io::Error,
    },

    /// Failed while reading the response body.
    #[error("response body read failed")]
    BodyReadFailed {
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation deadline elapsed.
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// Invalid configuration (bad URL, unknown preset, conflicting options).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP protocol violation by the peer.
    #[error("HTTP protocol error: {0}")]
    Protocol(String),

    /// Cookie parsing error.
    #[error("cookie parse error: {0}")]
    CookieParse(String),

    /// Response body decompression error.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Redirect limit exceeded.
    #[error("redirect limit exceeded ({count} redirects)")]
    RedirectLimit { count: u32 },

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error with no more specific classification.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// QUIC transport error.
    #[error("QUIC error: {0}")]
    Quic(String),
}

/// TLS alerts that, observed right at the ClientHello, suggest the
/// server rejected the fingerprint rather than the connection.
const FINGERPRINT_ALERTS: &[&str] = &["inappropriate_fallback", "handshake_failure"];

/// HTTP statuses that are retriable for idempotent requests.
const RETRIABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

impl Error {
    /// Classify this error for the retry loop.
    ///
    /// Retries themselves happen in the request engine, never inside a
    /// dialer; dialers only produce the classification.
    pub fn retriability(&self) -> Retriability {
        match self {
            Error::DnsFailed { .. }
            | Error::DialTcpFailed { .. }
            | Error::DialUdpFailed { .. }
            | Error::Http2PrefaceRejected { .. }
            | Error::Http3Unavailable { .. }
            | Error::SpeculativeTls { .. }
            | Error::BodyWriteFailed { .. }
            | Error::BodyReadFailed { .. } => Retriability::Retriable,

            Error::ProxyNegotiationFailed { status, .. } => match status {
                // 4xx means the proxy understood us and said no; retrying
                // the same credentials cannot help.
                Some(s) if (400..500).contains(s) => Retriability::Fatal,
                _ => Retriability::Retriable,
            },

            Error::TlsHandshakeFailed { alert, .. } => match alert {
                Some(a) if FINGERPRINT_ALERTS.contains(&a.as_str()) => {
                    Retriability::FingerprintSuspect
                }
                _ => Retriability::Retriable,
            },

            Error::HttpStatus { status } => {
                if RETRIABLE_STATUSES.contains(status) {
                    Retriability::Retriable
                } else {
                    Retriability::Fatal
                }
            }

            Error::CertificatePinMismatch { .. }
            | Error::Cancelled
            | Error::DeadlineExceeded(_)
            | Error::Configuration(_)
            | Error::RedirectLimit { .. }
            | Error::UrlParse(_)
            | Error::Json(_)
            | Error::CookieParse(_)
            | Error::Decompression(_) => Retriability::Fatal,

            Error::Protocol(_) | Error::Quic(_) | Error::Io(_) => Retriability::Retriable,
        }
    }

    /// A short corrective suggestion, where one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::ProxyNegotiationFailed {
                status: Some(407), ..
            } => Some("proxy rejected CONNECT with 407; set Proxy-Authorization or a proxy URL with credentials"),
            Error::CertificatePinMismatch { .. } => {
                Some("certificate pin mismatch is fatal; verify the pin set or remove pinning")
            }
            Error::Http3Unavailable { .. } => {
                Some("UDP may be blocked on this network; the origin is pinned to HTTP/2 for the cooldown window")
            }
            Error::TlsHandshakeFailed { alert: Some(_), .. } => {
                Some("the server may be rejecting this TLS fingerprint; try a different preset")
            }
            _ => None,
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a QUIC error.
    pub fn quic(message: impl Into<String>) -> Self {
        Self::Quic(message.into())
    }

    /// Create a TLS handshake error without an alert.
    pub fn tls(host: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            detail: detail.into(),
            alert: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses_match_policy() {
        for status in [408u16, 425, 429, 500, 502, 503, 504] {
            assert_eq!(
                Error::HttpStatus { status }.retriability(),
                Retriability::Retriable,
                "status {status} should be retriable"
            );
        }
        for status in [400u16, 401, 403, 404, 410, 501] {
            assert_eq!(
                Error::HttpStatus { status }.retriability(),
                Retriability::Fatal,
                "status {status} should be fatal"
            );
        }
    }

    #[test]
    fn proxy_auth_is_fatal_with_hint() {
        let err = Error::ProxyNegotiationFailed {
            reason: "CONNECT refused".into(),
            status: Some(407),
        };
        assert_eq!(err.retriability(), Retriability::Fatal);
        assert!(err.hint().unwrap().contains("407"));
    }

    #[test]
    fn fingerprint_alerts_are_flagged() {
        let err = Error::TlsHandshakeFailed {
            host: "example.test".into(),
            detail: "alert received".into(),
            alert: Some("handshake_failure".into()),
        };
        assert_eq!(err.retriability(), Retriability::FingerprintSuspect);

        let err = Error::TlsHandshakeFailed {
            host: "example.test".into(),
            detail: "connection reset".into(),
            alert: None,
        };
        assert_eq!(err.retriability(), Retriability::Retriable);
    }

    #[test]
    fn cancellation_is_terminal() {
        assert_eq!(Error::Cancelled.retriability(), Retriability::Fatal);
        assert_eq!(
            Error::DeadlineExceeded("connect").retriability(),
            Retriability::Fatal
        );
    }
}
