//! Browser fingerprint presets.
//!
//! A [`preset::Preset`] bundles everything that defines a browser's
//! on-wire identity: the TLS ClientHello shape ([`tls::TlsSpec`]), the
//! HTTP/2 connection preamble ([`http2::H2Spec`]), the QUIC transport
//! parameters ([`http3::H3Spec`]), the ordered header template and
//! client-hint material ([`headers`], [`platform::PlatformInfo`]).
//!
//! Presets are immutable after registration and looked up by name in the
//! process-wide [`preset::registry`].

pub mod headers;
pub mod http2;
pub mod http3;
pub mod platform;
pub mod preset;
pub mod tls;

pub use headers::{HeaderTemplate, RequestContext};
pub use preset::{registry, Preset};
pub use tls::TlsSpec;
