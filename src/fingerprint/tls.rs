//! TLS ClientHello specification per browser.
//!
//! The ClientHello is the most heavily fingerprinted artifact on the
//! wire (JA3/JA4). A [`TlsSpec`] captures everything BoringSSL lets us
//! control: cipher order, named groups (including post-quantum key
//! shares), signature algorithms, ALPN, and GREASE behavior.
//!
//! GREASE *positions* are part of the fingerprint; GREASE *values* are
//! drawn fresh per connection (RFC 8701 requires unpredictability, and
//! fingerprinting tools mask the value nibbles anyway). The per-session
//! [`GreaseDraw`] source keeps draws deterministic within a session so
//! forked sessions stay distinguishable in packet captures.

/// Chrome cipher suites in exact order (Chrome 120+ list, unchanged
/// through 143).
pub const CHROME_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
];

/// Chrome signature algorithms.
pub const CHROME_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
];

/// Chrome named groups. The hybrid post-quantum share leads since
/// Chrome 131.
pub const CHROME_CURVES: &[&str] = &["X25519MLKEM768", "x25519", "P-256", "P-384"];

/// Chrome 131 curves (Kyber draft rather than final ML-KEM).
pub const CHROME_131_CURVES: &[&str] = &["X25519Kyber768Draft00", "x25519", "P-256", "P-384"];

/// Chrome extension IDs in template order, used for JA4 reference.
/// Chrome permutes extension order per connection; JA4 sorts them, so
/// the *set* is what matters.
pub const CHROME_EXTENSION_IDS: &[u16] = &[
    0, 5, 10, 11, 13, 16, 18, 21, 23, 27, 35, 43, 45, 51, 17513, 65037, 65281,
];

/// Firefox cipher suites in exact order. Firefox ranks ChaCha20 above
/// AES-256 and keeps DHE fallbacks Chrome dropped.
pub const FIREFOX_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
];

/// Firefox signature algorithms.
pub const FIREFOX_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "ecdsa_secp384r1_sha384",
    "ecdsa_secp521r1_sha512",
    "rsa_pss_rsae_sha256",
    "rsa_pss_rsae_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha256",
    "rsa_pkcs1_sha384",
    "rsa_pkcs1_sha512",
];

/// Firefox named groups (includes P-521 and the MLKEM hybrid as of 133).
pub const FIREFOX_CURVES: &[&str] = &["X25519MLKEM768", "x25519", "P-256", "P-384", "P-521"];

/// Firefox extension IDs in template order.
pub const FIREFOX_EXTENSION_IDS: &[u16] = &[
    0, 5, 10, 11, 13, 16, 23, 28, 34, 35, 43, 45, 51, 65037, 65281,
];

/// Safari cipher suites in exact order (Safari keeps a longer CBC tail).
pub const SAFARI_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
];

/// Safari signature algorithms.
pub const SAFARI_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "ecdsa_sha1",
    "rsa_pss_rsae_sha384",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
    "rsa_pkcs1_sha1",
];

/// Safari named groups.
pub const SAFARI_CURVES: &[&str] = &["x25519", "P-256", "P-384", "P-521"];

/// Safari extension IDs in template order. Safari does not permute.
pub const SAFARI_EXTENSION_IDS: &[u16] = &[
    0, 5, 10, 13, 16, 18, 21, 23, 27, 43, 45, 51, 65281,
];

/// TLS ClientHello specification.
#[derive(Debug, Clone)]
pub struct TlsSpec {
    /// Cipher suites in exact order.
    pub cipher_list: &'static [&'static str],
    /// Signature algorithms in exact order.
    pub sigalgs: &'static [&'static str],
    /// Named groups / key-share offerings in exact order.
    pub curves: &'static [&'static str],
    /// Extension IDs this browser advertises (JA4 reference set).
    pub extension_ids: &'static [u16],
    /// ALPN protocols in offer order, e.g. `["h2", "http/1.1"]`.
    pub alpn: &'static [&'static str],
    /// Whether GREASE placeholders appear in the hello (Chrome/Safari
    /// yes, Firefox no).
    pub grease: bool,
    /// Whether extension order is permuted per connection (Chrome 110+,
    /// Firefox 135+; Safari never).
    pub permute_extensions: bool,
    /// Whether ALPS (application settings, ext 17513) is offered.
    pub alps: bool,
    /// Whether an ECH (encrypted client hello) extension is offered when
    /// a config is available.
    pub ech: bool,
    /// Certificate compression algorithms offered (ext 27).
    pub cert_compression: &'static [&'static str],
}

impl TlsSpec {
    pub fn chrome() -> Self {
        Self {
            cipher_list: CHROME_CIPHER_SUITES,
            sigalgs: CHROME_SIGNATURE_ALGORITHMS,
            curves: CHROME_CURVES,
            extension_ids: CHROME_EXTENSION_IDS,
            alpn: &["h2", "http/1.1"],
            grease: true,
            permute_extensions: true,
            alps: true,
            ech: true,
            cert_compression: &["brotli"],
        }
    }

    pub fn chrome_131() -> Self {
        Self {
            curves: CHROME_131_CURVES,
            ..Self::chrome()
        }
    }

    pub fn firefox() -> Self {
        Self {
            cipher_list: FIREFOX_CIPHER_SUITES,
            sigalgs: FIREFOX_SIGNATURE_ALGORITHMS,
            curves: FIREFOX_CURVES,
            extension_ids: FIREFOX_EXTENSION_IDS,
            alpn: &["h2", "http/1.1"],
            grease: false,
            permute_extensions: true,
            alps: false,
            ech: true,
            cert_compression: &["zlib", "brotli"],
        }
    }

    pub fn safari() -> Self {
        Self {
            cipher_list: SAFARI_CIPHER_SUITES,
            sigalgs: SAFARI_SIGNATURE_ALGORITHMS,
            curves: SAFARI_CURVES,
            extension_ids: SAFARI_EXTENSION_IDS,
            alpn: &["h2", "http/1.1"],
            grease: true,
            permute_extensions: false,
            alps: false,
            ech: false,
            cert_compression: &["zlib"],
        }
    }
}

/// Deterministic per-session GREASE value source.
///
/// Seeded once per session (from OS randomness); each connection draws
/// the next value. A plain xorshift keeps draws reproducible for a given
/// seed, which the save/load path relies on for stable fork behavior.
#[derive(Debug, Clone)]
pub struct GreaseDraw {
    state: u64,
}

impl GreaseDraw {
    pub fn from_seed(seed: u64) -> Self {
        // Zero would lock the generator.
        Self {
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
        }
    }

    /// Seed a new source from OS randomness.
    pub fn from_entropy() -> Self {
        let mut buf = [0u8; 8];
        // Failure to gather entropy leaves the fixed fallback seed.
        let _ = getrandom::getrandom(&mut buf);
        Self::from_seed(u64::from_le_bytes(buf))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Draw a GREASE u16 per RFC 8701: `0xNaNa` where N is one nibble.
    pub fn next_u16(&mut self) -> u16 {
        let n = (self.next() & 0x0f) as u16;
        (n << 12) | 0x0a0a | (n << 4)
    }

    /// Draw a GREASE QUIC transport parameter ID: `27 + 31 * N`.
    pub fn next_quic_param(&mut self) -> u64 {
        27 + 31 * (self.next() % 128)
    }
}
