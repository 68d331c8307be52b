//! Fingerprint fixtures: the values detection systems actually compute
//! from our first packets, asserted against reference captures.

use wraith::fingerprint::http2::H2Spec;
use wraith::fingerprint::tls::{GreaseDraw, TlsSpec};
use wraith::registry;

#[test]
fn akamai_h2_fingerprints_match_reference_captures() {
    assert_eq!(
        H2Spec::chrome().akamai_fingerprint(),
        "1:65536;2:0;4:6291456;6:262144|15663105|0|m,s,a,p"
    );
    assert_eq!(
        H2Spec::safari().akamai_fingerprint(),
        "4:4194304;3:100|10485760|0|m,s,p,a"
    );
    // Firefox's speculative priority tree, weights as Akamai reports
    // them (wire byte + 1).
    assert_eq!(
        H2Spec::firefox().akamai_fingerprint(),
        "1:65536;2:0;4:131072;5:16384|12517377|3:0:0:201,5:0:0:101,7:0:0:1,9:0:7:1,11:0:3:1,13:0:0:241|m,p,a,s"
    );
}

#[test]
fn tls_specs_match_browser_traits() {
    let chrome = TlsSpec::chrome();
    assert!(chrome.grease);
    assert!(chrome.permute_extensions);
    assert_eq!(chrome.alpn, &["h2", "http/1.1"]);
    assert_eq!(chrome.curves[0], "X25519MLKEM768");
    assert_eq!(chrome.cipher_list.len(), 15);
    assert_eq!(chrome.cipher_list[0], "TLS_AES_128_GCM_SHA256");

    let firefox = TlsSpec::firefox();
    assert!(!firefox.grease, "Firefox never GREASEs");
    assert!(firefox.curves.contains(&"P-521"));
    // Firefox ranks ChaCha20 second.
    assert_eq!(firefox.cipher_list[1], "TLS_CHACHA20_POLY1305_SHA256");

    let safari = TlsSpec::safari();
    assert!(!safari.permute_extensions, "Safari keeps a fixed order");
    assert!(safari.cipher_list.contains(&"TLS_RSA_WITH_AES_128_CBC_SHA"));
}

#[test]
fn grease_positions_not_values() {
    // Two sessions draw different GREASE values but identical shapes.
    let mut a = GreaseDraw::from_seed(11);
    let mut b = GreaseDraw::from_seed(77);
    let (va, vb) = (a.next_u16(), b.next_u16());
    assert_eq!(va & 0x0f0f, 0x0a0a);
    assert_eq!(vb & 0x0f0f, 0x0a0a);
    assert_ne!(
        GreaseDraw::from_seed(11).next_u16(),
        GreaseDraw::from_seed(12).next_u16(),
        "different seeds should diverge"
    );
}

#[test]
fn every_cataloged_preset_is_internally_consistent() {
    for name in registry().names() {
        let preset = registry().get(name).unwrap();

        // UA family and client-hint policy must agree.
        let is_chromium_stack = preset.user_agent.contains("Chrome/");
        assert_eq!(
            preset.client_hints, is_chromium_stack,
            "{name}: client hints must track the Chromium stack"
        );

        // Mobile flag and UA must agree.
        if preset.platform.mobile {
            assert!(
                preset.user_agent.contains("Mobile"),
                "{name}: mobile platform needs a mobile UA"
            );
        }

        // Every preset carries a non-empty template with a User-Agent.
        assert!(preset
            .headers
            .entries
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case("user-agent")));

        // H2 settings are never empty, window update always set.
        assert!(!preset.h2.settings.is_empty());
        assert!(preset.h2.window_update > 0);
    }
}

#[test]
fn safari_family_omits_sec_fetch_headers() {
    for name in ["safari-18", "safari-mobile-ios", "chrome-mobile-ios"] {
        let preset = registry().get(name).unwrap();
        assert!(
            !preset
                .headers
                .entries
                .iter()
                .any(|e| e.name.starts_with("Sec-Fetch")),
            "{name} should not template Sec-Fetch headers"
        );
    }
}
