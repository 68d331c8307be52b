//! The preset catalog: immutable browser identities by name.
//!
//! A preset is registered once at first use and never mutated; sessions
//! hold `Arc`s into the registry. Lookup is O(1). Alias names of the
//! form `<family>-latest` (and the bare `chrome-143`, which leaves the
//! platform unspecified) resolve to a concrete dated preset when the
//! registry is built.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::fingerprint::headers::{HeaderTemplate, Slot, TemplateEntry};
use crate::fingerprint::http2::H2Spec;
use crate::fingerprint::http3::H3Spec;
use crate::fingerprint::platform::PlatformInfo;
use crate::fingerprint::tls::TlsSpec;

/// A named, immutable browser identity.
#[derive(Debug, Clone)]
pub struct Preset {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub tls: TlsSpec,
    pub h2: H2Spec,
    /// None means the browser (or its platform port) never speaks HTTP/3.
    pub h3: Option<H3Spec>,
    pub headers: HeaderTemplate,
    pub platform: PlatformInfo,
    /// Whether this browser family sends `Sec-Ch-Ua*` client hints.
    pub client_hints: bool,
}

impl PartialEq for Preset {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Preset {}

impl Preset {
    /// Host:port-independent key for pools and ticket caches.
    pub fn key(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Header templates
//
// Chrome emits its client hints with lowercase names even over HTTP/1.1;
// the traditional headers keep their canonical casing. The HTTP/2 and
// HTTP/3 paths lowercase everything at encode time, so the casing here
// only shows on the HTTP/1.1 wire, which is exactly what Chrome does.
// ---------------------------------------------------------------------------

macro_rules! chrome_template {
    ($ua:expr, $sec_ch_ua:expr, $mobile:expr, $platform:expr) => {
        vec![
            TemplateEntry { name: "sec-ch-ua", slot: Slot::Static($sec_ch_ua) },
            TemplateEntry { name: "sec-ch-ua-mobile", slot: Slot::Static($mobile) },
            TemplateEntry { name: "sec-ch-ua-platform", slot: Slot::Static($platform) },
            TemplateEntry { name: "Upgrade-Insecure-Requests", slot: Slot::UpgradeInsecureRequests },
            TemplateEntry { name: "User-Agent", slot: Slot::Static($ua) },
            TemplateEntry { name: "Accept", slot: Slot::Accept },
            TemplateEntry { name: "Sec-Fetch-Site", slot: Slot::SecFetchSite },
            TemplateEntry { name: "Sec-Fetch-Mode", slot: Slot::SecFetchMode },
            TemplateEntry { name: "Sec-Fetch-User", slot: Slot::SecFetchUser },
            TemplateEntry { name: "Sec-Fetch-Dest", slot: Slot::SecFetchDest },
            TemplateEntry { name: "Referer", slot: Slot::Referer },
            TemplateEntry { name: "Accept-Encoding", slot: Slot::Static("gzip, deflate, br, zstd") },
            TemplateEntry { name: "Accept-Language", slot: Slot::AcceptLanguage },
            TemplateEntry { name: "Priority", slot: Slot::Priority },
        ]
    };
}

const CHROME_143_UA_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_143_UA_MACOS: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_143_UA_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_131_UA_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CHROME_143_UA_ANDROID: &str = "Mozilla/5.0 (Linux; Android 15; Pixel 9) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Mobile Safari/537.36";
const CHROME_143_UA_IOS: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/143.0.0.0 Mobile/15E148 Safari/604.1";
const FIREFOX_133_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0";
const SAFARI_18_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15";
const SAFARI_18_UA_IOS: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Mobile/15E148 Safari/604.1";

const CHROME_143_SEC_CH_UA: &str =
    r#""Google Chrome";v="143", "Chromium";v="143", "Not_A Brand";v="24""#;
const CHROME_131_SEC_CH_UA: &str =
    r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#;

const FIREFOX_TEMPLATE: &[TemplateEntry] = &[
    TemplateEntry { name: "User-Agent", slot: Slot::Static(FIREFOX_133_UA) },
    TemplateEntry { name: "Accept", slot: Slot::Accept },
    TemplateEntry { name: "Accept-Language", slot: Slot::AcceptLanguage },
    TemplateEntry { name: "Accept-Encoding", slot: Slot::Static("gzip, deflate, br, zstd") },
    TemplateEntry { name: "Referer", slot: Slot::Referer },
    TemplateEntry { name: "Upgrade-Insecure-Requests", slot: Slot::UpgradeInsecureRequests },
    TemplateEntry { name: "Sec-Fetch-Dest", slot: Slot::SecFetchDest },
    TemplateEntry { name: "Sec-Fetch-Mode", slot: Slot::SecFetchMode },
    TemplateEntry { name: "Sec-Fetch-Site", slot: Slot::SecFetchSite },
    TemplateEntry { name: "Sec-Fetch-User", slot: Slot::SecFetchUser },
    TemplateEntry { name: "Priority", slot: Slot::Priority },
];

// Safari's template carries no Sec-Fetch-* headers and no client hints.
macro_rules! safari_template {
    ($ua:expr) => {
        vec![
            TemplateEntry { name: "User-Agent", slot: Slot::Static($ua) },
            TemplateEntry { name: "Accept", slot: Slot::Accept },
            TemplateEntry { name: "Accept-Language", slot: Slot::AcceptLanguage },
            TemplateEntry { name: "Accept-Encoding", slot: Slot::Static("gzip, deflate, br") },
            TemplateEntry { name: "Referer", slot: Slot::Referer },
        ]
    };
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide preset registry, built once.
pub struct Registry {
    presets: HashMap<&'static str, Arc<Preset>>,
    aliases: HashMap<&'static str, &'static str>,
}

impl Registry {
    /// Look up a preset by name or alias.
    pub fn get(&self, name: &str) -> Result<Arc<Preset>> {
        let resolved = self.aliases.get(name).copied().unwrap_or(name);
        self.presets.get(resolved).cloned().ok_or_else(|| {
            Error::configuration(format!("unknown preset: {name:?}"))
        })
    }

    /// All concrete preset names (aliases excluded), for diagnostics.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.presets.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn insert(&mut self, preset: Preset) {
        self.presets.insert(preset.name, Arc::new(preset));
    }

    fn build() -> Self {
        let mut reg = Registry {
            presets: HashMap::new(),
            aliases: HashMap::new(),
        };

        let chrome_desktop = |name, ua, platform_hint, platform| Preset {
            name,
            user_agent: ua,
            tls: TlsSpec::chrome(),
            h2: H2Spec::chrome(),
            h3: Some(H3Spec::chrome()),
            headers: HeaderTemplate {
                entries: chrome_template!(ua, CHROME_143_SEC_CH_UA, "?0", platform_hint),
                accept_language: "en-US,en;q=0.9",
            },
            platform,
            client_hints: true,
        };

        reg.insert(chrome_desktop(
            "chrome-143-windows",
            CHROME_143_UA_WINDOWS,
            "\"Windows\"",
            PlatformInfo::WINDOWS,
        ));
        reg.insert(chrome_desktop(
            "chrome-143-macos",
            CHROME_143_UA_MACOS,
            "\"macOS\"",
            PlatformInfo::MACOS,
        ));
        reg.insert(chrome_desktop(
            "chrome-143-linux",
            CHROME_143_UA_LINUX,
            "\"Linux\"",
            PlatformInfo::LINUX,
        ));

        reg.insert(Preset {
            name: "chrome-131",
            user_agent: CHROME_131_UA_WINDOWS,
            tls: TlsSpec::chrome_131(),
            h2: H2Spec::chrome(),
            h3: Some(H3Spec::chrome()),
            headers: HeaderTemplate {
                entries: chrome_template!(
                    CHROME_131_UA_WINDOWS,
                    CHROME_131_SEC_CH_UA,
                    "?0",
                    "\"Windows\""
                ),
                accept_language: "en-US,en;q=0.9",
            },
            platform: PlatformInfo::WINDOWS,
            client_hints: true,
        });

        reg.insert(Preset {
            name: "firefox-133",
            user_agent: FIREFOX_133_UA,
            tls: TlsSpec::firefox(),
            h2: H2Spec::firefox(),
            h3: Some(H3Spec::firefox()),
            headers: HeaderTemplate {
                entries: FIREFOX_TEMPLATE.to_vec(),
                accept_language: "en-US,en;q=0.5",
            },
            platform: PlatformInfo::WINDOWS,
            client_hints: false,
        });

        reg.insert(Preset {
            name: "safari-18",
            user_agent: SAFARI_18_UA,
            tls: TlsSpec::safari(),
            h2: H2Spec::safari(),
            h3: Some(H3Spec::safari()),
            headers: HeaderTemplate {
                entries: safari_template!(SAFARI_18_UA),
                accept_language: "en-US,en;q=0.9",
            },
            platform: PlatformInfo::MACOS,
            client_hints: false,
        });

        reg.insert(Preset {
            name: "chrome-mobile-android",
            user_agent: CHROME_143_UA_ANDROID,
            tls: TlsSpec::chrome(),
            h2: H2Spec::chrome(),
            h3: Some(H3Spec::chrome()),
            headers: HeaderTemplate {
                entries: chrome_template!(
                    CHROME_143_UA_ANDROID,
                    CHROME_143_SEC_CH_UA,
                    "?1",
                    "\"Android\""
                ),
                accept_language: "en-US,en;q=0.9",
            },
            platform: PlatformInfo::ANDROID,
            client_hints: true,
        });

        // Chrome on iOS rides WebKit's network stack, so its TLS, H2
        // and header shapes are Safari's; only the User-Agent differs.
        reg.insert(Preset {
            name: "chrome-mobile-ios",
            user_agent: CHROME_143_UA_IOS,
            tls: TlsSpec::safari(),
            h2: H2Spec::safari(),
            h3: Some(H3Spec::safari()),
            headers: HeaderTemplate {
                entries: safari_template!(CHROME_143_UA_IOS),
                accept_language: "en-US,en;q=0.9",
            },
            platform: PlatformInfo::IOS,
            client_hints: false,
        });

        reg.insert(Preset {
            name: "safari-mobile-ios",
            user_agent: SAFARI_18_UA_IOS,
            tls: TlsSpec::safari(),
            h2: H2Spec::safari(),
            h3: Some(H3Spec::safari()),
            headers: HeaderTemplate {
                entries: safari_template!(SAFARI_18_UA_IOS),
                accept_language: "en-US,en;q=0.9",
            },
            platform: PlatformInfo::IOS,
            client_hints: false,
        });

        // Aliases resolve when the registry is built, not at lookup.
        reg.aliases.insert("chrome-143", "chrome-143-windows");
        reg.aliases.insert("chrome-latest", "chrome-143-windows");
        reg.aliases.insert("firefox-latest", "firefox-133");
        reg.aliases.insert("safari-latest", "safari-18");

        reg
    }
}

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_resolve() {
        let names = [
            "chrome-143",
            "chrome-143-windows",
            "chrome-143-macos",
            "chrome-143-linux",
            "chrome-131",
            "firefox-133",
            "safari-18",
            "chrome-mobile-ios",
            "chrome-mobile-android",
            "safari-mobile-ios",
            "chrome-latest",
            "firefox-latest",
            "safari-latest",
        ];
        for name in names {
            assert!(registry().get(name).is_ok(), "preset {name} should resolve");
        }
        assert!(registry().get("netscape-4").is_err());
    }

    #[test]
    fn aliases_resolve_to_dated_presets() {
        assert_eq!(registry().get("chrome-latest").unwrap().name, "chrome-143-windows");
        assert_eq!(registry().get("firefox-latest").unwrap().name, "firefox-133");
        assert_eq!(registry().get("chrome-143").unwrap().name, "chrome-143-windows");
    }

    #[test]
    fn equality_is_by_name() {
        let a = registry().get("chrome-143-linux").unwrap();
        let b = registry().get("chrome-143-linux").unwrap();
        let c = registry().get("chrome-143-macos").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn ios_chrome_wears_webkit_fingerprints() {
        let ios = registry().get("chrome-mobile-ios").unwrap();
        assert!(ios.user_agent.contains("CriOS"));
        // WebKit stack underneath: Safari TLS and H2 shapes.
        assert!(!ios.tls.permute_extensions);
        assert_eq!(ios.h2.window_update, H2Spec::safari().window_update);
        assert!(!ios.client_hints);
    }

    #[test]
    fn mobile_presets_set_mobile_hint() {
        let android = registry().get("chrome-mobile-android").unwrap();
        assert!(android.platform.mobile);
        assert_eq!(android.platform.mobile_hint(), "?1");
    }

    #[test]
    fn registry_lookup_returns_shared_instances() {
        let a = registry().get("safari-18").unwrap();
        let b = registry().get("safari-latest").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
