//! QUIC / HTTP/3 transport parameter specification per browser.
//!
//! HTTP/3 fingerprinting inspects the QUIC transport parameters in the
//! Initial packet, the SETTINGS frame on the control stream, and the
//! presence of GREASE (reserved transport parameters, reserved settings,
//! and the greased QUIC bit). An [`H3Spec`] pins the values the dialer
//! feeds into quiche.

/// QUIC transport parameter and HTTP/3 SETTINGS specification.
#[derive(Debug, Clone)]
pub struct H3Spec {
    /// `max_idle_timeout` in milliseconds.
    pub max_idle_timeout_ms: u64,
    /// `max_udp_payload_size` transport parameter.
    pub max_udp_payload_size: u64,
    /// `initial_max_data` (connection-level flow control).
    pub initial_max_data: u64,
    /// `initial_max_stream_data_bidi_local`.
    pub initial_max_stream_data_bidi_local: u64,
    /// `initial_max_stream_data_bidi_remote`.
    pub initial_max_stream_data_bidi_remote: u64,
    /// `initial_max_stream_data_uni`.
    pub initial_max_stream_data_uni: u64,
    /// `initial_max_streams_bidi`.
    pub initial_max_streams_bidi: u64,
    /// `initial_max_streams_uni`.
    pub initial_max_streams_uni: u64,
    /// QPACK dynamic table capacity advertised in SETTINGS.
    pub qpack_max_table_capacity: u64,
    /// QPACK blocked streams advertised in SETTINGS.
    pub qpack_blocked_streams: u64,
    /// Whether the connection greases reserved transport parameters and
    /// settings identifiers.
    pub grease: bool,
    /// Whether active connection migration is disabled.
    pub disable_active_migration: bool,
    /// Datagram support (required for MASQUE; Chrome enables it).
    pub enable_datagrams: bool,
}

impl H3Spec {
    /// Chrome QUIC parameters (stable across recent versions).
    pub fn chrome() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 1472,
            initial_max_data: 15_728_640,
            initial_max_stream_data_bidi_local: 6_291_456,
            initial_max_stream_data_bidi_remote: 6_291_456,
            initial_max_stream_data_uni: 6_291_456,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 103,
            qpack_max_table_capacity: 65_536,
            qpack_blocked_streams: 100,
            grease: true,
            disable_active_migration: true,
            enable_datagrams: true,
        }
    }

    /// Firefox QUIC parameters.
    pub fn firefox() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 1500,
            initial_max_data: 25_165_824,
            initial_max_stream_data_bidi_local: 10_485_760,
            initial_max_stream_data_bidi_remote: 10_485_760,
            initial_max_stream_data_uni: 10_485_760,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            qpack_max_table_capacity: 65_536,
            qpack_blocked_streams: 20,
            grease: true,
            disable_active_migration: false,
            enable_datagrams: true,
        }
    }

    /// Safari QUIC parameters.
    pub fn safari() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 1452,
            initial_max_data: 2_097_152,
            initial_max_stream_data_bidi_local: 1_048_576,
            initial_max_stream_data_bidi_remote: 1_048_576,
            initial_max_stream_data_uni: 1_048_576,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 100,
            grease: true,
            disable_active_migration: true,
            enable_datagrams: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_flow_control_shape() {
        let spec = H3Spec::chrome();
        // Chrome's connection window is 2.5x its stream window.
        assert_eq!(
            spec.initial_max_data,
            spec.initial_max_stream_data_bidi_local * 5 / 2
        );
        assert!(spec.enable_datagrams);
    }

    #[test]
    fn all_specs_grease() {
        assert!(H3Spec::chrome().grease);
        assert!(H3Spec::firefox().grease);
        assert!(H3Spec::safari().grease);
    }
}
