//! Header templates and per-request coherence.
//!
//! A browser's headers are not independent: `Accept` depends on what is
//! being fetched, `Sec-Fetch-*` must agree with the navigation context,
//! `Upgrade-Insecure-Requests` appears only on navigations, client hints
//! must match the User-Agent. This module owns those rules.
//!
//! The template fixes the *order* and casing of header names; the
//! [`RequestContext`] fills the context-dependent values; caller-supplied
//! headers win on value but keep the template position.

use crate::fingerprint::preset::Preset;

/// `Sec-Fetch-Mode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Document navigation (typing a URL, clicking a link).
    Navigate,
    /// Cross-origin fetch()/XHR with CORS.
    Cors,
    /// Simple no-CORS subresource loads (images, scripts, styles).
    NoCors,
    /// Same-origin requests.
    SameOrigin,
    /// WebSocket handshake.
    WebSocket,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Navigate => "navigate",
            FetchMode::Cors => "cors",
            FetchMode::NoCors => "no-cors",
            FetchMode::SameOrigin => "same-origin",
            FetchMode::WebSocket => "websocket",
        }
    }
}

/// `Sec-Fetch-Dest` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDest {
    Document,
    Image,
    Script,
    Style,
    Font,
    Media,
    Manifest,
    Worker,
    /// XHR/fetch destinations serialize as "empty".
    Empty,
    WebSocket,
}

impl FetchDest {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchDest::Document => "document",
            FetchDest::Image => "image",
            FetchDest::Script => "script",
            FetchDest::Style => "style",
            FetchDest::Font => "font",
            FetchDest::Media => "media",
            FetchDest::Manifest => "manifest",
            FetchDest::Worker => "worker",
            FetchDest::Empty => "empty",
            FetchDest::WebSocket => "websocket",
        }
    }
}

/// `Sec-Fetch-Site` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSite {
    /// Direct navigation (no referrer).
    None,
    SameOrigin,
    SameSite,
    CrossSite,
}

impl FetchSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchSite::None => "none",
            FetchSite::SameOrigin => "same-origin",
            FetchSite::SameSite => "same-site",
            FetchSite::CrossSite => "cross-site",
        }
    }
}

/// Context a request is made in, driving coherent header generation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub mode: FetchMode,
    pub dest: FetchDest,
    pub site: FetchSite,
    /// `Sec-Fetch-User: ?1` is emitted only for user-triggered navigations.
    pub is_user_triggered: bool,
    /// Page that initiated the request; becomes the `Referer`.
    pub referrer: Option<String>,
    /// High-entropy client hints are only sent after a server opted in
    /// via `Accept-CH`.
    pub include_high_entropy_hints: bool,
}

impl RequestContext {
    /// Top-level page navigation (address bar, link click).
    pub fn navigation() -> Self {
        Self {
            mode: FetchMode::Navigate,
            dest: FetchDest::Document,
            site: FetchSite::None,
            is_user_triggered: true,
            referrer: None,
            include_high_entropy_hints: false,
        }
    }

    /// fetch()/XHR issued by a page.
    pub fn xhr(referrer: &str, target: &str) -> Self {
        Self {
            mode: FetchMode::Cors,
            dest: FetchDest::Empty,
            site: compute_fetch_site(Some(referrer), target),
            is_user_triggered: false,
            referrer: Some(referrer.to_string()),
            include_high_entropy_hints: false,
        }
    }

    /// Image subresource load.
    pub fn image(referrer: &str, target: &str) -> Self {
        Self::subresource(FetchDest::Image, referrer, target)
    }

    /// Script subresource load.
    pub fn script(referrer: &str, target: &str) -> Self {
        Self::subresource(FetchDest::Script, referrer, target)
    }

    /// Stylesheet subresource load.
    pub fn style(referrer: &str, target: &str) -> Self {
        Self::subresource(FetchDest::Style, referrer, target)
    }

    /// Font subresource load.
    pub fn font(referrer: &str, target: &str) -> Self {
        Self::subresource(FetchDest::Font, referrer, target)
    }

    /// WebSocket handshake context.
    pub fn websocket(referrer: &str, target: &str) -> Self {
        Self {
            mode: FetchMode::WebSocket,
            dest: FetchDest::WebSocket,
            site: compute_fetch_site(Some(referrer), target),
            is_user_triggered: false,
            referrer: Some(referrer.to_string()),
            include_high_entropy_hints: false,
        }
    }

    fn subresource(dest: FetchDest, referrer: &str, target: &str) -> Self {
        Self {
            mode: FetchMode::NoCors,
            dest,
            site: compute_fetch_site(Some(referrer), target),
            is_user_triggered: false,
            referrer: Some(referrer.to_string()),
            include_high_entropy_hints: false,
        }
    }
}

/// Compute `Sec-Fetch-Site` from the referrer/target relationship.
pub fn compute_fetch_site(referrer: Option<&str>, target: &str) -> FetchSite {
    let Some(referrer) = referrer.filter(|r| !r.is_empty()) else {
        return FetchSite::None;
    };
    let (Ok(ref_url), Ok(targ_url)) = (url::Url::parse(referrer), url::Url::parse(target)) else {
        return FetchSite::CrossSite;
    };

    if ref_url.scheme() == targ_url.scheme()
        && ref_url.host_str() == targ_url.host_str()
        && ref_url.port_or_known_default() == targ_url.port_or_known_default()
    {
        return FetchSite::SameOrigin;
    }

    let (Some(ref_host), Some(targ_host)) = (ref_url.host_str(), targ_url.host_str()) else {
        return FetchSite::CrossSite;
    };
    if ref_url.scheme() == targ_url.scheme()
        && registrable_domain(ref_host) == registrable_domain(targ_host)
    {
        return FetchSite::SameSite;
    }
    FetchSite::CrossSite
}

/// Registrable-domain heuristic: last two labels. Good enough for
/// Sec-Fetch-Site on common domains; multi-label public suffixes degrade
/// to same-site, which is the value browsers send for sibling subdomains
/// anyway.
fn registrable_domain(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    let _tld_dot = dots.next();
    match dots.next() {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

/// How a template slot gets its value.
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    /// Fixed value (User-Agent, client hints, Accept-Encoding...).
    Static(&'static str),
    /// `Accept`, chosen from the (mode, dest) table.
    Accept,
    /// `Accept-Language`, overridable per session.
    AcceptLanguage,
    /// `Sec-Fetch-Site` from context.
    SecFetchSite,
    /// `Sec-Fetch-Mode` from context.
    SecFetchMode,
    /// `Sec-Fetch-Dest` from context.
    SecFetchDest,
    /// `Sec-Fetch-User: ?1`, only for user-triggered navigations.
    SecFetchUser,
    /// `Upgrade-Insecure-Requests: 1`, only on navigations.
    UpgradeInsecureRequests,
    /// `Referer` when the context carries one.
    Referer,
    /// `Priority` request header (Chrome/Firefox on H2/H3).
    Priority,
}

/// One ordered header slot: canonical name plus fill rule.
#[derive(Debug, Clone, Copy)]
pub struct TemplateEntry {
    pub name: &'static str,
    pub slot: Slot,
}

/// Ordered header template for a preset.
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    pub entries: Vec<TemplateEntry>,
    /// Default `Accept-Language` (overridable per session).
    pub accept_language: &'static str,
}

/// The `Accept` value table keyed by (mode, dest).
fn accept_value(mode: FetchMode, dest: FetchDest) -> &'static str {
    match mode {
        FetchMode::Navigate => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"
        }
        FetchMode::Cors | FetchMode::SameOrigin | FetchMode::WebSocket => "*/*",
        FetchMode::NoCors => match dest {
            FetchDest::Image => "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8",
            FetchDest::Style => "text/css,*/*;q=0.1",
            _ => "*/*",
        },
    }
}

/// Assemble the final ordered header list for a request.
///
/// Walks the preset template in order. A caller-supplied header
/// (case-insensitive name match) wins on value but keeps the template
/// position. Context slots that do not apply (e.g. `Sec-Fetch-User` on a
/// subresource) are omitted entirely. Caller headers not present in the
/// template are appended after it, and `Cookie` goes last.
///
/// With `tls_only` set the template is skipped wholesale and only the
/// caller's headers are emitted; an upstream browser already shaped
/// them and re-shaping would destroy that authenticity.
pub fn assemble_headers(
    preset: &Preset,
    ctx: &RequestContext,
    explicit: &[(String, String)],
    accept_language: Option<&str>,
    cookie_header: Option<String>,
    tls_only: bool,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(explicit.len() + 16);
    let mut consumed = vec![false; explicit.len()];

    let take_explicit = |name: &str, consumed: &mut [bool]| -> Option<String> {
        for (i, (k, v)) in explicit.iter().enumerate() {
            if !consumed[i] && k.eq_ignore_ascii_case(name) {
                consumed[i] = true;
                return Some(v.clone());
            }
        }
        None
    };

    if tls_only {
        for (i, (k, v)) in explicit.iter().enumerate() {
            if !consumed[i] && !k.eq_ignore_ascii_case("cookie") {
                out.push((k.clone(), v.clone()));
            }
        }
        if let Some(cookie) = explicit
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        {
            out.push(cookie.clone());
        } else if let Some(cookie) = cookie_header {
            out.push(("Cookie".to_string(), cookie));
        }
        return out;
    }

    for entry in &preset.headers.entries {
        if let Some(v) = take_explicit(entry.name, &mut consumed) {
            out.push((entry.name.to_string(), v));
            continue;
        }
        let value: Option<String> = match entry.slot {
            Slot::Static(v) => Some(v.to_string()),
            Slot::Accept => Some(accept_value(ctx.mode, ctx.dest).to_string()),
            Slot::AcceptLanguage => Some(
                accept_language
                    .unwrap_or(preset.headers.accept_language)
                    .to_string(),
            ),
            Slot::SecFetchSite => Some(ctx.site.as_str().to_string()),
            Slot::SecFetchMode => Some(ctx.mode.as_str().to_string()),
            Slot::SecFetchDest => Some(ctx.dest.as_str().to_string()),
            Slot::SecFetchUser => {
                if ctx.is_user_triggered && ctx.mode == FetchMode::Navigate {
                    Some("?1".to_string())
                } else {
                    None
                }
            }
            Slot::UpgradeInsecureRequests => {
                if ctx.mode == FetchMode::Navigate {
                    Some("1".to_string())
                } else {
                    None
                }
            }
            Slot::Referer => ctx.referrer.clone(),
            Slot::Priority => match ctx.mode {
                FetchMode::Navigate => Some("u=0, i".to_string()),
                FetchMode::NoCors if ctx.dest == FetchDest::Image => Some("u=1, i".to_string()),
                _ => None,
            },
        };
        if let Some(v) = value {
            out.push((entry.name.to_string(), v));
        }
    }

    // High-entropy hints right after the low-entropy ones, when the
    // server opted in via Accept-CH.
    if ctx.include_high_entropy_hints && preset.client_hints {
        let p = &preset.platform;
        out.push((
            "Sec-Ch-Ua-Arch".to_string(),
            format!("\"{}\"", p.arch),
        ));
        out.push((
            "Sec-Ch-Ua-Bitness".to_string(),
            format!("\"{}\"", p.bitness),
        ));
        out.push((
            "Sec-Ch-Ua-Model".to_string(),
            format!("\"{}\"", p.model),
        ));
        out.push((
            "Sec-Ch-Ua-Platform-Version".to_string(),
            format!("\"{}\"", p.platform_version),
        ));
    }

    // Caller extras keep their relative order, appended before Cookie.
    let mut explicit_cookie: Option<(String, String)> = None;
    for (i, (k, v)) in explicit.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        if k.eq_ignore_ascii_case("cookie") {
            explicit_cookie = Some((k.clone(), v.clone()));
            continue;
        }
        out.push((k.clone(), v.clone()));
    }

    if let Some((k, v)) = explicit_cookie {
        out.push((k, v));
    } else if let Some(cookie) = cookie_header {
        if !cookie.is_empty() {
            out.push(("Cookie".to_string(), cookie));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::registry;

    fn names(headers: &[(String, String)]) -> Vec<&str> {
        headers.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn navigation_headers_are_coherent() {
        let preset = registry().get("chrome-143-linux").unwrap();
        let headers = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &[],
            None,
            None,
            false,
        );

        assert_eq!(value(&headers, "Sec-Fetch-Mode"), Some("navigate"));
        assert_eq!(value(&headers, "Sec-Fetch-Dest"), Some("document"));
        assert_eq!(value(&headers, "Sec-Fetch-Site"), Some("none"));
        assert_eq!(value(&headers, "Sec-Fetch-User"), Some("?1"));
        assert_eq!(value(&headers, "Upgrade-Insecure-Requests"), Some("1"));
        assert!(value(&headers, "Accept").unwrap().starts_with("text/html"));
    }

    #[test]
    fn xhr_drops_navigation_only_headers() {
        let preset = registry().get("chrome-143-linux").unwrap();
        let ctx = RequestContext::xhr("https://app.example.test/", "https://api.example.test/v1");
        let headers = assemble_headers(&preset, &ctx, &[], None, None, false);

        assert_eq!(value(&headers, "Sec-Fetch-Mode"), Some("cors"));
        assert_eq!(value(&headers, "Sec-Fetch-Dest"), Some("empty"));
        assert_eq!(value(&headers, "Sec-Fetch-Site"), Some("same-site"));
        assert_eq!(value(&headers, "Sec-Fetch-User"), None);
        assert_eq!(value(&headers, "Upgrade-Insecure-Requests"), None);
        assert_eq!(value(&headers, "Accept"), Some("*/*"));
        assert_eq!(
            value(&headers, "Referer"),
            Some("https://app.example.test/")
        );
    }

    #[test]
    fn caller_value_wins_but_keeps_slot_position() {
        let preset = registry().get("chrome-143-linux").unwrap();
        let custom = vec![("accept".to_string(), "application/json".to_string())];
        let headers = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &custom,
            None,
            None,
            false,
        );

        let default = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &[],
            None,
            None,
            false,
        );
        let pos = |hs: &[(String, String)]| {
            hs.iter()
                .position(|(k, _)| k.eq_ignore_ascii_case("accept"))
                .unwrap()
        };
        assert_eq!(pos(&headers), pos(&default));
        assert_eq!(value(&headers, "Accept"), Some("application/json"));
    }

    #[test]
    fn extras_append_before_cookie() {
        let preset = registry().get("chrome-143-linux").unwrap();
        let custom = vec![("X-Custom".to_string(), "1".to_string())];
        let headers = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &custom,
            None,
            Some("sid=abc".to_string()),
            false,
        );
        let ns = names(&headers);
        let custom_pos = ns.iter().position(|n| *n == "X-Custom").unwrap();
        let cookie_pos = ns.iter().position(|n| *n == "Cookie").unwrap();
        assert!(custom_pos < cookie_pos);
        assert_eq!(cookie_pos, ns.len() - 1);
    }

    #[test]
    fn tls_only_emits_caller_headers_verbatim() {
        let preset = registry().get("chrome-143-linux").unwrap();
        let custom = vec![
            ("X-Upstream".to_string(), "browser".to_string()),
            ("User-Agent".to_string(), "upstream-agent".to_string()),
        ];
        let headers = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &custom,
            None,
            Some("sid=abc".to_string()),
            true,
        );
        assert_eq!(headers.len(), 3);
        assert_eq!(value(&headers, "User-Agent"), Some("upstream-agent"));
        assert_eq!(value(&headers, "Cookie"), Some("sid=abc"));
        assert_eq!(value(&headers, "Sec-Fetch-Mode"), None);
    }

    #[test]
    fn safari_template_omits_sec_fetch() {
        let preset = registry().get("safari-18").unwrap();
        let headers = assemble_headers(
            &preset,
            &RequestContext::navigation(),
            &[],
            None,
            None,
            false,
        );
        assert_eq!(value(&headers, "Sec-Fetch-Mode"), None);
        assert_eq!(value(&headers, "Sec-Ch-Ua"), None);
        assert!(value(&headers, "User-Agent").unwrap().contains("Safari"));
    }

    #[test]
    fn fetch_site_classification() {
        let site = |r: &str, t: &str| compute_fetch_site(Some(r), t);
        assert_eq!(
            site("https://a.test/", "https://a.test/x"),
            FetchSite::SameOrigin
        );
        assert_eq!(
            site("https://www.a.test/", "https://cdn.a.test/x"),
            FetchSite::SameSite
        );
        assert_eq!(
            site("https://a.test/", "https://b.test/"),
            FetchSite::CrossSite
        );
        assert_eq!(compute_fetch_site(None, "https://a.test/"), FetchSite::None);
        // Scheme downgrade is cross-site.
        assert_eq!(
            site("https://a.test/", "http://a.test/"),
            FetchSite::CrossSite
        );
    }

    #[test]
    fn high_entropy_hints_only_on_request() {
        let preset = registry().get("chrome-143-windows").unwrap();
        let mut ctx = RequestContext::navigation();
        let before = assemble_headers(&preset, &ctx, &[], None, None, false);
        assert_eq!(value(&before, "Sec-Ch-Ua-Arch"), None);

        ctx.include_high_entropy_hints = true;
        let after = assemble_headers(&preset, &ctx, &[], None, None, false);
        assert_eq!(value(&after, "Sec-Ch-Ua-Arch"), Some("\"x86\""));
        assert_eq!(value(&after, "Sec-Ch-Ua-Bitness"), Some("\"64\""));
    }
}
