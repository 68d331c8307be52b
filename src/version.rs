//! HTTP protocol version selection.

use serde::{Deserialize, Serialize};

/// HTTP protocol version, used both for reporting which protocol served a
/// response and for forcing a protocol on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HttpVersion {
    /// Let the arbiter pick (ALPN + Alt-Svc + learned hints).
    #[default]
    Auto,
    /// HTTP/1.1 only.
    H1,
    /// HTTP/2 only.
    H2,
    /// HTTP/3 only (fails rather than falling back).
    H3,
}

impl HttpVersion {
    /// Wire name as it appears in response metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Auto => "auto",
            HttpVersion::H1 => "HTTP/1.1",
            HttpVersion::H2 => "HTTP/2",
            HttpVersion::H3 => "HTTP/3",
        }
    }

    /// Whether connections of this version are multiplexed in the pool.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, HttpVersion::H2 | HttpVersion::H3)
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
