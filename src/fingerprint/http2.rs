//! HTTP/2 connection preamble specification per browser.
//!
//! The Akamai HTTP/2 fingerprint is derived from the first frames a
//! client sends: `settings|window_update|priority|pseudo_headers`.
//! An [`H2Spec`] pins all four components so the dialer can emit a
//! byte-exact preamble.
//!
//! Chrome 143: `1:65536;2:0;4:6291456;6:262144|15663105|0|m,s,a,p`
//! Firefox 133: `1:65536;2:0;4:131072;5:16384|12517377|3:0:0:201,...|m,p,a,s`
//! Safari 18: `4:4194304;3:100|10485760|0|m,s,p,a`

/// One SETTINGS parameter as (identifier, value). Order matters: it is
/// emitted exactly as listed and fingerprinted as such.
pub type SettingEntry = (u16, u32);

/// A PRIORITY frame template entry: (stream_id, depends_on, weight
/// byte as sent on the wire, exclusive).
pub type PriorityEntry = (u32, u32, u8, bool);

/// Pseudo-header emission order, visible in the Akamai fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PseudoOrder {
    /// Chrome: `:method, :scheme, :authority, :path` (m,s,a,p)
    #[default]
    Msap,
    /// Firefox: `:method, :path, :authority, :scheme` (m,p,a,s)
    Mpas,
    /// Safari: `:method, :scheme, :path, :authority` (m,s,p,a)
    Mspa,
}

impl PseudoOrder {
    /// Indices into `[method, authority, scheme, path]` selecting the
    /// emission order.
    pub fn order(&self) -> [usize; 4] {
        match self {
            PseudoOrder::Msap => [0, 2, 1, 3],
            PseudoOrder::Mpas => [0, 3, 1, 2],
            PseudoOrder::Mspa => [0, 2, 3, 1],
        }
    }

    /// The Akamai fingerprint notation for this order.
    pub fn akamai_string(&self) -> &'static str {
        match self {
            PseudoOrder::Msap => "m,s,a,p",
            PseudoOrder::Mpas => "m,p,a,s",
            PseudoOrder::Mspa => "m,s,p,a",
        }
    }
}

/// HTTP/2 preamble specification.
#[derive(Debug, Clone)]
pub struct H2Spec {
    /// SETTINGS parameters in exact emission order.
    pub settings: &'static [SettingEntry],
    /// Whether a GREASE setting id is appended after the real settings
    /// (Chrome behavior; the id/value are drawn per connection).
    pub grease_setting: bool,
    /// Connection-level WINDOW_UPDATE increment sent right after
    /// SETTINGS. Zero means no update is sent.
    pub window_update: u32,
    /// PRIORITY frames emitted once at connection start (Firefox's
    /// speculative priority tree). Empty for Chrome and Safari.
    pub priority_preamble: &'static [PriorityEntry],
    /// Pseudo-header order on every request.
    pub pseudo_order: PseudoOrder,
    /// HPACK dynamic table size the encoder commits to.
    pub hpack_table_size: u32,
}

/// SETTINGS identifiers per RFC 9113.
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl H2Spec {
    /// Chrome 107+ preamble (stable through 143).
    pub fn chrome() -> Self {
        Self {
            settings: &[
                (SETTINGS_HEADER_TABLE_SIZE, 65536),
                (SETTINGS_ENABLE_PUSH, 0),
                (SETTINGS_INITIAL_WINDOW_SIZE, 6291456),
                (SETTINGS_MAX_HEADER_LIST_SIZE, 262144),
            ],
            grease_setting: true,
            window_update: 15663105,
            priority_preamble: &[],
            pseudo_order: PseudoOrder::Msap,
            hpack_table_size: 65536,
        }
    }

    /// Firefox preamble with its characteristic priority tree.
    pub fn firefox() -> Self {
        Self {
            settings: &[
                (SETTINGS_HEADER_TABLE_SIZE, 65536),
                (SETTINGS_ENABLE_PUSH, 0),
                (SETTINGS_INITIAL_WINDOW_SIZE, 131072),
                (SETTINGS_MAX_FRAME_SIZE, 16384),
            ],
            grease_setting: false,
            window_update: 12517377,
            // Weight field is the wire byte (weight - 1).
            priority_preamble: &[
                (3, 0, 200, false),
                (5, 0, 100, false),
                (7, 0, 0, false),
                (9, 7, 0, false),
                (11, 3, 0, false),
                (13, 0, 240, false),
            ],
            pseudo_order: PseudoOrder::Mpas,
            hpack_table_size: 65536,
        }
    }

    /// Safari preamble.
    pub fn safari() -> Self {
        Self {
            settings: &[
                (SETTINGS_INITIAL_WINDOW_SIZE, 4194304),
                (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
            ],
            grease_setting: false,
            window_update: 10485760,
            priority_preamble: &[],
            pseudo_order: PseudoOrder::Mspa,
            hpack_table_size: 4096,
        }
    }

    /// Render the Akamai fingerprint string for this spec (diagnostics
    /// and fixture tests).
    pub fn akamai_fingerprint(&self) -> String {
        let settings = self
            .settings
            .iter()
            .map(|(id, v)| format!("{}:{}", id, v))
            .collect::<Vec<_>>()
            .join(";");
        let priority = if self.priority_preamble.is_empty() {
            "0".to_string()
        } else {
            self.priority_preamble
                .iter()
                .map(|(id, dep, weight, _)| format!("{}:{}:{}:{}", id, 0, dep, *weight as u16 + 1))
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "{}|{}|{}|{}",
            settings,
            self.window_update,
            priority,
            self.pseudo_order.akamai_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_akamai_fingerprint() {
        assert_eq!(
            H2Spec::chrome().akamai_fingerprint(),
            "1:65536;2:0;4:6291456;6:262144|15663105|0|m,s,a,p"
        );
    }

    #[test]
    fn safari_akamai_fingerprint() {
        assert_eq!(
            H2Spec::safari().akamai_fingerprint(),
            "4:4194304;3:100|10485760|0|m,s,p,a"
        );
    }

    #[test]
    fn firefox_has_priority_tree() {
        let spec = H2Spec::firefox();
        assert_eq!(spec.priority_preamble.len(), 6);
        assert_eq!(spec.pseudo_order.akamai_string(), "m,p,a,s");
        // Stream 9 depends on 7, stream 11 on 3.
        assert_eq!(spec.priority_preamble[3].1, 7);
        assert_eq!(spec.priority_preamble[4].1, 3);
    }

    #[test]
    fn pseudo_orders_select_correctly() {
        // Input layout: [method, authority, scheme, path]
        let fields = ["m", "a", "s", "p"];
        let render = |o: PseudoOrder| {
            o.order()
                .iter()
                .map(|&i| fields[i])
                .collect::<Vec<_>>()
                .join(",")
        };
        assert_eq!(render(PseudoOrder::Msap), "m,s,a,p");
        assert_eq!(render(PseudoOrder::Mpas), "m,p,a,s");
        assert_eq!(render(PseudoOrder::Mspa), "m,s,p,a");
    }
}
