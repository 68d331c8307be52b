//! RFC 6265 cookie storage.
//!
//! The jar is internally shared: cloning a [`CookieJar`] yields a handle
//! onto the same store, which is how forked sessions observe each
//! other's cookie writes immediately. Readers snapshot under a coarse
//! RW lock; the engine updates the jar only after a response body is
//! fully received.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// SameSite attribute (RFC 6265bis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// A single stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub expires: Option<DateTime<Utc>>,
    /// Set by the Domain attribute being absent (RFC 6265 §5.3).
    pub host_only: bool,
    /// Creation time, used for Cookie-header ordering (RFC 6265 §5.4).
    pub creation_time: DateTime<Utc>,
    /// Last time this cookie was emitted on a request.
    pub last_access_time: DateTime<Utc>,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(&domain.into()),
            path: "/".to_string(),
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
            host_only: true,
            creation_time: now,
            last_access_time: now,
        }
    }

    /// Parse a `Set-Cookie` header received from `request_url`.
    pub fn parse_set_cookie(header: &str, request_url: &Url) -> Result<Self> {
        let request_domain = request_url
            .host_str()
            .ok_or_else(|| Error::CookieParse("no host in request URL".to_string()))?;

        let mut parts = header.split(';').map(str::trim);
        let pair = parts
            .next()
            .ok_or_else(|| Error::CookieParse("empty Set-Cookie".to_string()))?;
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::CookieParse("missing '=' in cookie pair".to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::CookieParse("empty cookie name".to_string()));
        }

        let mut cookie = Cookie::new(name, value.trim(), request_domain);
        let mut domain_attr = false;
        let mut max_age: Option<i64> = None;

        for attr in parts {
            if attr.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if attr.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if let Some((key, val)) = attr.split_once('=') {
                let val = val.trim();
                match key.trim().to_ascii_lowercase().as_str() {
                    "domain" => {
                        let d = normalize_domain(val);
                        // RFC 6265 §5.3: the Domain attribute must
                        // domain-match the request host.
                        if !domain_match(request_domain, &d) {
                            return Err(Error::CookieParse(format!(
                                "domain {d:?} does not cover request host {request_domain:?}"
                            )));
                        }
                        cookie.domain = d;
                        domain_attr = true;
                    }
                    "path" => {
                        if val.starts_with('/') {
                            cookie.path = val.to_string();
                        }
                    }
                    "expires" => cookie.expires = parse_cookie_date(val),
                    "max-age" => max_age = val.parse().ok(),
                    "samesite" => {
                        cookie.same_site = match val.to_ascii_lowercase().as_str() {
                            "strict" => Some(SameSite::Strict),
                            "lax" => Some(SameSite::Lax),
                            "none" => Some(SameSite::None),
                            _ => None,
                        };
                    }
                    _ => {}
                }
            }
        }

        cookie.host_only = !domain_attr;

        // Max-Age wins over Expires (RFC 6265 §5.3). Zero or negative
        // means immediate expiry, which deletes the cookie on store.
        if let Some(max_age) = max_age {
            cookie.expires = Some(if max_age > 0 {
                Utc::now() + chrono::Duration::seconds(max_age)
            } else {
                Utc::now() - chrono::Duration::seconds(1)
            });
        }

        Ok(cookie)
    }

    pub fn is_expired(&self) -> bool {
        self.expires.map(|e| e <= Utc::now()).unwrap_or(false)
    }

    /// RFC 6265 §5.4 eligibility for a request URL.
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let domain_ok = if self.host_only {
            host.eq_ignore_ascii_case(&self.domain)
        } else {
            domain_match(host, &self.domain)
        };
        domain_ok && path_match(url.path(), &self.path) && !self.is_expired()
    }
}

/// A cookie's domain-match per RFC 6265 §5.1.3.
fn domain_match(host: &str, cookie_domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = cookie_domain.to_ascii_lowercase();
    host == domain || (host.ends_with(&domain) && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// Path-match per RFC 6265 §5.1.4.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').to_ascii_lowercase()
}

/// Parse the date formats seen in Expires attributes.
fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc());
        }
    }
    None
}

/// Key a cookie is stored under.
type JarKey = (String, String, String); // (domain, path, name)

/// Shared cookie store.
///
/// Cloning shares the underlying map; forked sessions rely on this.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<RwLock<HashMap<JarKey, Cookie>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie, replacing any existing (domain, path, name) entry.
    /// An already-expired cookie deletes the entry instead (this is how
    /// `Max-Age=0` removals work).
    pub fn store(&self, cookie: Cookie) {
        let key = (
            cookie.domain.clone(),
            cookie.path.clone(),
            cookie.name.clone(),
        );
        let mut map = self.inner.write().expect("cookie jar lock poisoned");
        if cookie.is_expired() {
            map.remove(&key);
            return;
        }
        // Replacing keeps the original creation time (RFC 6265 §5.3 step 11.3).
        if let Some(existing) = map.get(&key) {
            let creation_time = existing.creation_time;
            let mut cookie = cookie;
            cookie.creation_time = creation_time;
            map.insert(key, cookie);
        } else {
            map.insert(key, cookie);
        }
    }

    /// Parse and store every `Set-Cookie` header of a response.
    /// Malformed headers are skipped (browsers do the same).
    pub fn store_response_cookies<'a>(
        &self,
        set_cookie_headers: impl Iterator<Item = &'a str>,
        request_url: &Url,
    ) {
        for header in set_cookie_headers {
            match Cookie::parse_set_cookie(header, request_url) {
                Ok(cookie) => self.store(cookie),
                Err(err) => {
                    tracing::debug!(header, %err, "ignoring malformed Set-Cookie");
                }
            }
        }
    }

    /// Convenience API for callers: set a cookie by name/value with
    /// optional domain and path.
    pub fn set(&self, name: &str, value: &str, domain: &str, path: Option<&str>) {
        let mut cookie = Cookie::new(name, value, domain);
        if let Some(path) = path {
            cookie.path = path.to_string();
        }
        self.store(cookie);
    }

    /// Snapshot all live cookies.
    pub fn all(&self) -> Vec<Cookie> {
        let map = self.inner.read().expect("cookie jar lock poisoned");
        map.values().filter(|c| !c.is_expired()).cloned().collect()
    }

    /// Cookies eligible for a request, in emission order: longest path
    /// first, then earliest creation time (RFC 6265 §5.4).
    pub fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let mut eligible: Vec<Cookie> = {
            let map = self.inner.read().expect("cookie jar lock poisoned");
            map.values().filter(|c| c.matches(url)).cloned().collect()
        };
        eligible.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.creation_time.cmp(&b.creation_time))
        });

        if !eligible.is_empty() {
            let now = Utc::now();
            let mut map = self.inner.write().expect("cookie jar lock poisoned");
            for c in &eligible {
                let key = (c.domain.clone(), c.path.clone(), c.name.clone());
                if let Some(stored) = map.get_mut(&key) {
                    stored.last_access_time = now;
                }
            }
        }
        eligible
    }

    /// Build the `Cookie` header value for a request, or None when no
    /// cookie is eligible.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Drop expired cookies.
    pub fn evict_expired(&self) {
        let mut map = self.inner.write().expect("cookie jar lock poisoned");
        map.retain(|_, c| !c.is_expired());
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut map = self.inner.write().expect("cookie jar lock poisoned");
        map.clear();
    }

    /// Replace the jar contents (used by session state loading).
    pub fn replace_all(&self, cookies: Vec<Cookie>) {
        let mut map = self.inner.write().expect("cookie jar lock poisoned");
        map.clear();
        for c in cookies {
            map.insert((c.domain.clone(), c.path.clone(), c.name.clone()), c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn parse_basic_set_cookie() {
        let c = Cookie::parse_set_cookie(
            "sid=abc123; Path=/; Secure; HttpOnly; SameSite=Lax",
            &url("https://www.example.test/login"),
        )
        .unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain, "www.example.test");
        assert!(c.secure);
        assert!(c.http_only);
        assert!(c.host_only);
        assert_eq!(c.same_site, Some(SameSite::Lax));
    }

    #[test]
    fn domain_attribute_widens_scope() {
        let c = Cookie::parse_set_cookie(
            "sid=x; Domain=.example.test",
            &url("https://www.example.test/"),
        )
        .unwrap();
        assert!(!c.host_only);
        assert_eq!(c.domain, "example.test");

        let jar = CookieJar::new();
        jar.store(c);
        assert_eq!(jar.cookies_for(&url("https://api.example.test/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://examp1e.test/")).len(), 0);
    }

    #[test]
    fn foreign_domain_attribute_rejected() {
        let err = Cookie::parse_set_cookie(
            "sid=x; Domain=evil.test",
            &url("https://www.example.test/"),
        );
        assert!(err.is_err());
    }

    #[test]
    fn secure_cookies_need_https() {
        let jar = CookieJar::new();
        let mut c = Cookie::new("s", "1", "example.test");
        c.secure = true;
        jar.store(c);
        assert_eq!(jar.cookies_for(&url("http://example.test/")).len(), 0);
        assert_eq!(jar.cookies_for(&url("https://example.test/")).len(), 1);
    }

    #[test]
    fn path_matching() {
        assert!(path_match("/docs/page", "/docs"));
        assert!(path_match("/docs/", "/docs/"));
        assert!(path_match("/docs", "/docs"));
        assert!(!path_match("/docsearch", "/docs"));
        assert!(!path_match("/", "/docs"));
    }

    #[test]
    fn header_order_path_length_then_creation() {
        let jar = CookieJar::new();
        let u = url("https://example.test/a/b/c");

        let mut general = Cookie::new("general", "1", "example.test");
        general.creation_time = Utc::now() - chrono::Duration::seconds(10);
        jar.store(general);

        let mut deep = Cookie::new("deep", "2", "example.test");
        deep.path = "/a/b".to_string();
        jar.store(deep);

        assert_eq!(jar.cookie_header(&u).unwrap(), "deep=2; general=1");
    }

    #[test]
    fn max_age_zero_deletes() {
        let jar = CookieJar::new();
        let u = url("https://example.test/");
        jar.set("sid", "abc", "example.test", None);
        assert!(jar.cookie_header(&u).is_some());

        jar.store_response_cookies(
            std::iter::once("sid=abc; Max-Age=0"),
            &u,
        );
        assert!(jar.cookie_header(&u).is_none());
    }

    #[test]
    fn replacement_keeps_creation_time() {
        let jar = CookieJar::new();
        let mut first = Cookie::new("a", "1", "example.test");
        first.creation_time = Utc::now() - chrono::Duration::seconds(100);
        let original_creation = first.creation_time;
        jar.store(first);
        jar.set("a", "2", "example.test", None);

        let all = jar.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "2");
        assert_eq!(all[0].creation_time, original_creation);
    }

    #[test]
    fn clones_share_storage() {
        let jar = CookieJar::new();
        let sibling = jar.clone();
        sibling.set("shared", "yes", "example.test", None);
        assert_eq!(jar.all().len(), 1);
    }

    #[test]
    fn cookie_date_formats() {
        assert!(parse_cookie_date("Wed, 21 Oct 2026 07:28:00 GMT").is_some());
        assert!(parse_cookie_date("Sun, 06-Nov-94 08:49:37 GMT").is_some());
        assert!(parse_cookie_date("not a date").is_none());
    }
}
