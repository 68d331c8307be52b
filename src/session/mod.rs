//! Sessions: the stateful client surface.
//!
//! A session owns a preset reference, a cookie jar, a ticket cache, a
//! connection pool, the arbiter's hint map and two independent proxy
//! slots. Forks share the jar and ticket cache (mutations are visible
//! to all siblings immediately) but keep their own pools and hints.

pub mod state;
pub mod ticket;

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;

use crate::arbiter::Arbiter;
use crate::cookie::{Cookie, CookieJar};
use crate::engine::{Engine, EngineOptions};
use crate::error::Result;
use crate::fingerprint::headers::RequestContext;
use crate::fingerprint::tls::GreaseDraw;
use crate::fingerprint::{registry, Preset};
use crate::keylog::{KeyLogSink, KeyLogSlot};
use crate::pool::Pool;
use crate::proxy::ProxyConfig;
use crate::request::Request;
use crate::response::Response;
use crate::version::HttpVersion;

use state::SessionState;
use ticket::{EchConfigCache, TicketBackend, TicketCache};

/// How long `close`/`refresh` wait for in-flight streams.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// Warmup subresource budget, deliberately conservative: enough to
/// populate tickets and cookies without replaying a whole page load.
const WARMUP_MAX_SCRIPTS: usize = 3;
const WARMUP_MAX_STYLES: usize = 2;
const WARMUP_MAX_IMAGES: usize = 3;

/// Builder with the closed option set.
pub struct SessionBuilder {
    preset: String,
    options: EngineOptions,
    tcp_proxy: Option<String>,
    udp_proxy: Option<String>,
    forced: HttpVersion,
    ech_overrides: Vec<(String, Vec<u8>)>,
}

impl SessionBuilder {
    pub fn new(preset: impl Into<String>) -> Self {
        Self {
            preset: preset.into(),
            options: EngineOptions::default(),
            tcp_proxy: None,
            udp_proxy: None,
            forced: HttpVersion::Auto,
            ech_overrides: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.total_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn retries(mut self, budget: u32) -> Self {
        self.options.retry_budget = budget;
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.options.follow_redirects = allow;
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.options.max_redirects = max;
        self
    }

    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.tcp_proxy = Some(url.into());
        self
    }

    pub fn udp_proxy(mut self, url: impl Into<String>) -> Self {
        self.udp_proxy = Some(url.into());
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.options.verify_tls = verify;
        self
    }

    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.forced = version;
        self
    }

    pub fn key_log_sink(self, sink: Arc<dyn KeyLogSink>) -> Self {
        *self.options.key_log.lock().expect("key log slot poisoned") = Some(sink);
        self
    }

    pub fn local_bind(mut self, addr: IpAddr) -> Self {
        self.options.local_bind = Some(addr);
        self
    }

    pub fn cert_pins(mut self, pins: Vec<String>) -> Self {
        self.options.cert_pins = pins;
        self
    }

    /// Pre-seed an ECH config for a domain (overrides DNS discovery).
    pub fn ech_config(mut self, domain: impl Into<String>, config: Vec<u8>) -> Self {
        self.ech_overrides.push((domain.into(), config));
        self
    }

    /// Emit only caller-supplied headers, preserving authenticity of an
    /// upstream browser's header set.
    pub fn tls_only(mut self, tls_only: bool) -> Self {
        self.options.tls_only = tls_only;
        self
    }

    /// Cache-key isolator for shared ticket backends.
    pub fn session_identifier(mut self, id: impl Into<String>) -> Self {
        self.options.session_id = Some(id.into());
        self
    }

    /// Permit 0-RTT early data for non-idempotent methods. Off by
    /// default because replayed POSTs are an attack, not a latency win.
    pub fn allow_unsafe_early_data(mut self, allow: bool) -> Self {
        self.options.allow_unsafe_early_data = allow;
        self
    }

    pub fn accept_language(mut self, lang: impl Into<String>) -> Self {
        self.options.accept_language = Some(lang.into());
        self
    }

    pub fn build(self) -> Result<Session> {
        let preset = registry().get(&self.preset)?;
        let tcp_proxy = self
            .tcp_proxy
            .as_deref()
            .map(ProxyConfig::from_url)
            .transpose()?;
        let udp_proxy = self
            .udp_proxy
            .as_deref()
            .map(ProxyConfig::from_url)
            .transpose()?;

        let jar = CookieJar::new();
        let tickets = TicketCache::new(self.options.session_id.clone());
        let ech = EchConfigCache::new();
        for (domain, config) in self.ech_overrides {
            ech.put(&domain, config);
        }

        Ok(Session::assemble(
            preset,
            jar,
            tickets,
            ech,
            self.forced,
            self.options,
            tcp_proxy,
            udp_proxy,
        ))
    }
}

/// A stateful HTTP session. Cheap to clone; clones are the same
/// session (fork instead for siblings with separate pools).
#[derive(Clone)]
pub struct Session {
    engine: Arc<Engine>,
    ech: EchConfigCache,
    tcp_proxy: Arc<Mutex<Option<ProxyConfig>>>,
    udp_proxy: Arc<Mutex<Option<ProxyConfig>>>,
    children: Arc<Mutex<Vec<Session>>>,
    closed: Arc<AtomicBool>,
    /// Forks share the parent's jar/tickets; only the owning (root)
    /// session evicts the shared caches on close.
    is_fork: bool,
}

impl Session {
    /// Shorthand for `SessionBuilder::new(preset).build()`.
    pub fn new(preset: &str) -> Result<Self> {
        SessionBuilder::new(preset).build()
    }

    pub fn builder(preset: &str) -> SessionBuilder {
        SessionBuilder::new(preset)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        preset: Arc<Preset>,
        jar: CookieJar,
        tickets: TicketCache,
        ech: EchConfigCache,
        forced: HttpVersion,
        options: EngineOptions,
        tcp_proxy: Option<ProxyConfig>,
        udp_proxy: Option<ProxyConfig>,
    ) -> Self {
        let engine = Engine::new(
            preset,
            jar,
            tickets,
            Arbiter::new(),
            Pool::default(),
            Arc::new(Mutex::new(GreaseDraw::from_entropy())),
            Arc::new(Mutex::new(forced)),
            options,
        );
        Self {
            engine: Arc::new(engine),
            ech,
            tcp_proxy: Arc::new(Mutex::new(tcp_proxy)),
            udp_proxy: Arc::new(Mutex::new(udp_proxy)),
            children: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            is_fork: false,
        }
    }

    fn assert_open(&self) {
        // Using a closed session is a programming error, matching the
        // documented contract.
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "session used after close()"
        );
    }

    pub fn preset(&self) -> &Preset {
        &self.engine.preset
    }

    /// The session's cookie jar (shared with forks).
    pub fn cookie_jar(&self) -> &CookieJar {
        &self.engine.jar
    }

    /// The session's ticket cache (shared with forks).
    pub fn ticket_cache(&self) -> &TicketCache {
        &self.engine.tickets
    }

    // --- requests -------------------------------------------------------

    /// Execute a prepared request.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.assert_open();
        let tcp = self.tcp_proxy.lock().expect("proxy slot poisoned").clone();
        let udp = self.udp_proxy.lock().expect("proxy slot poisoned").clone();
        self.engine.execute(request, tcp, udp).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Request::get(url)?).await
    }

    pub async fn post(&self, url: &str, body: impl Into<crate::request::Body>) -> Result<Response> {
        self.request(Request::post(url)?.body(body)).await
    }

    pub async fn put(&self, url: &str, body: impl Into<crate::request::Body>) -> Result<Response> {
        self.request(Request::new(Method::PUT, url)?.body(body)).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<crate::request::Body>) -> Result<Response> {
        self.request(Request::new(Method::PATCH, url)?.body(body))
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::DELETE, url)?).await
    }

    pub async fn head(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::HEAD, url)?).await
    }

    pub async fn options(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::OPTIONS, url)?).await
    }

    // --- state ----------------------------------------------------------

    /// Swap the proxy slots. `None` clears a slot. Existing pooled
    /// connections keep their old path; new dials use the new one.
    pub fn set_proxy(&self, tcp: Option<&str>, udp: Option<&str>) -> Result<()> {
        self.assert_open();
        let tcp = tcp.map(ProxyConfig::from_url).transpose()?;
        let udp = udp.map(ProxyConfig::from_url).transpose()?;
        *self.tcp_proxy.lock().expect("proxy slot poisoned") = tcp;
        *self.udp_proxy.lock().expect("proxy slot poisoned") = udp;
        Ok(())
    }

    pub fn set_cookie(&self, name: &str, value: &str, domain: &str, path: Option<&str>) {
        self.assert_open();
        self.engine.jar.set(name, value, domain, path);
    }

    pub fn get_cookies(&self) -> Vec<Cookie> {
        self.engine.jar.all()
    }

    pub fn set_key_log_sink(&self, sink: Option<Arc<dyn KeyLogSink>>) {
        let slot: &KeyLogSlot = &self.engine.options.key_log;
        *slot.lock().expect("key log slot poisoned") = sink;
    }

    pub fn register_ticket_backend(
        &self,
        backend: Arc<dyn TicketBackend>,
        on_error: Arc<dyn Fn(String) + Send + Sync>,
    ) {
        self.engine.tickets.register_backend(backend, on_error);
    }

    // --- lifecycle ------------------------------------------------------

    /// Drop every pooled connection (waiting out in-flight streams up
    /// to the close deadline) while keeping cookies, tickets and
    /// arbiter hints. Subsequent requests handshake fresh — and can use
    /// 0-RTT thanks to the preserved tickets. Optionally swaps the
    /// forced protocol; the switch persists.
    pub async fn refresh(&self, switch_protocol: Option<HttpVersion>) {
        self.assert_open();
        self.engine.pool.close_with_timeout(CLOSE_DEADLINE).await;
        if let Some(protocol) = switch_protocol {
            *self.engine.forced.lock().expect("forced protocol lock poisoned") = protocol;
        }
    }

    /// Simulate a human page load: fetch the document, then a bounded
    /// set of discovered subresources with correct contexts, referrer
    /// and inter-request jitter. Populates cookies and tickets before
    /// real traffic; subresource failures are swallowed.
    pub async fn warmup(&self, url: &str) -> Result<()> {
        self.assert_open();
        let mut response = self
            .request(Request::get(url)?.context(RequestContext::navigation()))
            .await?;
        let final_url = response.final_url.clone();
        let Ok(html) = response.text().await else {
            return Ok(()); // not a text document; nothing to discover
        };

        let subresources = discover_subresources(
            &html,
            &final_url,
            WARMUP_MAX_SCRIPTS,
            WARMUP_MAX_STYLES,
            WARMUP_MAX_IMAGES,
        );

        for (kind, sub_url) in subresources {
            jitter_delay().await;
            let context = match kind {
                SubresourceKind::Script => RequestContext::script(&final_url, sub_url.as_str()),
                SubresourceKind::Style => RequestContext::style(&final_url, sub_url.as_str()),
                SubresourceKind::Image => RequestContext::image(&final_url, sub_url.as_str()),
            };
            let request = match Request::get(sub_url.as_str()) {
                Ok(r) => r.context(context),
                Err(_) => continue,
            };
            if let Err(err) = self.request(request).await {
                tracing::debug!(url = %sub_url, error = %err, "warmup subresource failed");
            }
        }
        Ok(())
    }

    /// Produce `n` sibling sessions sharing this session's cookie jar,
    /// ticket cache and ECH configs, each with its own pool and hint
    /// map. Closing the parent closes the forks; closing a fork leaves
    /// the parent alive.
    pub fn fork(&self, n: usize) -> Vec<Session> {
        self.assert_open();
        let mut forks = Vec::with_capacity(n);
        for _ in 0..n {
            let forced = *self.engine.forced.lock().expect("forced protocol lock poisoned");
            let mut fork = Session::assemble(
                self.engine.preset.clone(),
                self.engine.jar.clone(),
                self.engine.tickets.clone(),
                self.ech.clone(),
                forced,
                self.engine.options.clone(),
                self.tcp_proxy.lock().expect("proxy slot poisoned").clone(),
                self.udp_proxy.lock().expect("proxy slot poisoned").clone(),
            );
            fork.is_fork = true;
            forks.push(fork.clone());
            self.children
                .lock()
                .expect("children lock poisoned")
                .push(fork);
        }
        forks
    }

    /// Serialize cookies, tickets, ECH configs, hints and the forced
    /// protocol to a versioned blob at `path` (owner-only permissions).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.assert_open();
        let mut state = SessionState::new(self.engine.preset.name);
        state.forced_protocol = *self.engine.forced.lock().expect("forced protocol lock poisoned");
        state.cookies = self.engine.jar.all();
        state.tickets = self.engine.tickets.export();
        state.ech_configs = SessionState::encode_ech_configs(self.ech.export());
        state.arbiter_hints = self.engine.arbiter.export();
        state.save(path)
    }

    /// Rebuild a session from a saved blob.
    pub fn load(path: impl AsRef<Path>) -> Result<Session> {
        let state = SessionState::load(path)?;
        let session = SessionBuilder::new(&state.preset)
            .http_version(state.forced_protocol)
            .build()?;
        session.engine.jar.replace_all(state.cookies.clone());
        session.engine.tickets.import(state.tickets.clone());
        session.ech.import(state.decode_ech_configs());
        session.engine.arbiter.import(state.arbiter_hints.clone());
        Ok(session)
    }

    /// Close the session and its forks: drain pooled connections up to
    /// the close deadline, then tear down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<Session> = {
            let mut guard = self.children.lock().expect("children lock poisoned");
            guard.drain(..).collect()
        };
        for child in children {
            // Box the recursion: async fn can't recurse unboxed.
            Box::pin(child.close()).await;
        }
        self.engine.pool.close_with_timeout(CLOSE_DEADLINE).await;
        // Tickets are bearer credentials: they die with the owning
        // session unless a shared backend persists them. A fork closing
        // alone must not evict state its siblings still use.
        if !self.is_fork && !self.engine.tickets.has_backend() {
            self.engine.tickets.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Random 50–250 ms pause between warmup subrequests.
async fn jitter_delay() {
    let mut buf = [0u8; 1];
    let _ = getrandom::getrandom(&mut buf);
    let millis = 50 + (u64::from(buf[0]) * 200) / 255;
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubresourceKind {
    Script,
    Style,
    Image,
}

/// Best-effort subresource discovery: `<script src>`, stylesheet
/// `<link href>` and `<img src>` up to the per-kind budgets. This is a
/// substring scan, not an HTML parser — warmup only needs a plausible
/// handful of fetches, not fidelity.
fn discover_subresources(
    html: &str,
    base_url: &str,
    max_scripts: usize,
    max_styles: usize,
    max_images: usize,
) -> Vec<(SubresourceKind, url::Url)> {
    let Ok(base) = url::Url::parse(base_url) else {
        return Vec::new();
    };
    let lower = html.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut counts = [0usize; 3];

    let mut push = |kind: SubresourceKind, raw: &str| {
        let slot = kind as usize;
        let budget = [max_scripts, max_styles, max_images][slot];
        if counts[slot] >= budget {
            return;
        }
        if raw.starts_with("data:") || raw.starts_with("javascript:") {
            return;
        }
        if let Ok(resolved) = base.join(raw) {
            if matches!(resolved.scheme(), "http" | "https") {
                counts[slot] += 1;
                out.push((kind, resolved));
            }
        }
    };

    for (tag, attr, kind) in [
        ("<script", "src", SubresourceKind::Script),
        ("<link", "href", SubresourceKind::Style),
        ("<img", "src", SubresourceKind::Image),
    ] {
        let mut search_from = 0;
        while let Some(tag_pos) = lower[search_from..].find(tag) {
            let tag_start = search_from + tag_pos;
            let Some(tag_end) = lower[tag_start..].find('>') else {
                break;
            };
            let tag_text = &lower[tag_start..tag_start + tag_end];
            let original = &html[tag_start..tag_start + tag_end];
            search_from = tag_start + tag_end;

            // Only stylesheet links count.
            if kind == SubresourceKind::Style && !tag_text.contains("stylesheet") {
                continue;
            }
            if let Some(value) = extract_attr(tag_text, original, attr) {
                push(kind, value);
            }
        }
    }
    out
}

/// Pull a quoted attribute value out of a tag, preserving original
/// casing (URLs are case-sensitive in their paths).
fn extract_attr<'a>(tag_lower: &str, tag_original: &'a str, attr: &str) -> Option<&'a str> {
    let needle = format!("{attr}=");
    let pos = tag_lower.find(&needle)?;
    let rest = &tag_original[pos + needle.len()..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        // Unquoted attribute: read to whitespace.
        let end = rest.find(|c: char| c.is_whitespace()).unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(&inner[..end])
}
