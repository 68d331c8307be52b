//! The request engine: header coherence, protocol selection, retries
//! and redirects.
//!
//! One engine instance serves one session. Every request flows
//! Session → engine → arbiter plan → pool → dialer → proxy substrate;
//! responses feed cookies, Alt-Svc hints and tickets back into session
//! state.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::arbiter::{Arbiter, DialPlan, H3_HEAD_START};
use crate::cookie::CookieJar;
use crate::error::{Error, Result, Retriability};
use crate::fingerprint::headers::{assemble_headers, compute_fetch_site, RequestContext};
use crate::fingerprint::tls::GreaseDraw;
use crate::fingerprint::Preset;
use crate::keylog::KeyLogSlot;
use crate::pool::{Pool, PoolKey};
use crate::proxy::{self, ProxyConfig, Target, TcpTunnel};
use crate::request::{Body, CancelToken, Request};
use crate::response::{Response, Timing};
use crate::session::ticket::TicketCache;
use crate::transport::dial::{self, DialOptions};
use crate::transport::h1::H1Connection;
use crate::transport::speculative::SpeculativeStream;
use crate::transport::tls::{AlpnMode, MaybeTlsStream, TcpLink, TlsConnector};
use crate::transport::{h2, h3, Connection};
use crate::version::HttpVersion;

/// Engine-level knobs, fixed at session build time (per-request
/// overrides ride on the Request).
#[derive(Clone)]
pub struct EngineOptions {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub retry_budget: u32,
    pub max_redirects: u32,
    pub follow_redirects: bool,
    pub verify_tls: bool,
    pub cert_pins: Vec<String>,
    pub local_bind: Option<IpAddr>,
    /// Mutable sink slot shared with the session, read per handshake.
    pub key_log: KeyLogSlot,
    pub tls_only: bool,
    pub allow_unsafe_early_data: bool,
    pub accept_language: Option<String>,
    pub session_id: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(120),
            retry_budget: 2,
            max_redirects: 10,
            follow_redirects: true,
            verify_tls: true,
            cert_pins: Vec::new(),
            local_bind: None,
            key_log: KeyLogSlot::default(),
            tls_only: false,
            allow_unsafe_early_data: false,
            accept_language: None,
            session_id: None,
        }
    }
}

/// The per-session engine.
pub struct Engine {
    pub preset: Arc<Preset>,
    pub jar: CookieJar,
    pub tickets: TicketCache,
    pub arbiter: Arbiter,
    pub pool: Pool,
    pub grease: Arc<Mutex<GreaseDraw>>,
    pub options: EngineOptions,
    /// Forced protocol slot; `refresh(switch_protocol)` swaps it on a
    /// live session.
    pub forced: Arc<Mutex<HttpVersion>>,
    tls: TlsConnector,
}

impl Engine {
    pub fn new(
        preset: Arc<Preset>,
        jar: CookieJar,
        tickets: TicketCache,
        arbiter: Arbiter,
        pool: Pool,
        grease: Arc<Mutex<GreaseDraw>>,
        forced: Arc<Mutex<HttpVersion>>,
        options: EngineOptions,
    ) -> Self {
        let tls = TlsConnector::new(
            preset.tls.clone(),
            preset.name,
            tickets.clone(),
            options.cert_pins.clone(),
            options.verify_tls,
            options.key_log.clone(),
        );
        Self {
            preset,
            jar,
            tickets,
            arbiter,
            pool,
            grease,
            options,
            forced,
            tls,
        }
    }

    /// Execute a request: retry loop around single attempts, then
    /// redirect following.
    pub async fn execute(
        &self,
        request: Request,
        tcp_proxy: Option<ProxyConfig>,
        udp_proxy: Option<ProxyConfig>,
    ) -> Result<Response> {
        let deadline = request.timeout.unwrap_or(self.options.total_timeout);
        let work = self.execute_with_redirects(request, tcp_proxy, udp_proxy);
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded("request")),
        }
    }

    async fn execute_with_redirects(
        &self,
        request: Request,
        tcp_proxy: Option<ProxyConfig>,
        udp_proxy: Option<ProxyConfig>,
    ) -> Result<Response> {
        let cancel = request.cancel.clone();
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut context = request.context.clone();
        let explicit = request.headers.clone();
        let mut body = match request.body {
            Body::Empty => None,
            Body::Bytes(b) => Some(b),
            Body::Stream(rx) => Some(collect_stream(rx).await?),
        };

        let mut history: Vec<String> = Vec::new();

        loop {
            cancel.check()?;
            let mut response = self
                .attempt_with_retries(
                    &method,
                    &url,
                    &context,
                    &explicit,
                    body.clone(),
                    &tcp_proxy,
                    &udp_proxy,
                    &cancel,
                )
                .await?;

            if let Some(alt_svc) = response.header("alt-svc") {
                self.arbiter
                    .record_alt_svc(&origin_of(&url), alt_svc);
            }

            if !self.options.follow_redirects || !response.is_redirect() {
                response.redirect_history = history;
                return Ok(response);
            }
            let Some(location) = response.redirect_location() else {
                response.redirect_history = history;
                return Ok(response);
            };

            if history.len() as u32 >= self.options.max_redirects {
                return Err(Error::RedirectLimit {
                    count: history.len() as u32,
                });
            }

            let next = url
                .join(location)
                .map_err(|e| Error::protocol(format!("bad Location {location:?}: {e}")))?;
            tracing::debug!(status = response.status, from = %url, to = %next, "following redirect");

            // 303 (and 301/302 for non-HEAD) rewrite to GET and drop
            // the body; 307/308 preserve method and body.
            match response.status {
                301 | 302 | 303 => {
                    if method != Method::HEAD {
                        method = Method::GET;
                    }
                    body = None;
                }
                _ => {}
            }

            history.push(url.to_string());
            context.referrer = Some(url.to_string());
            context.site = compute_fetch_site(Some(url.as_str()), next.as_str());
            // Redirected navigations are no longer user-triggered.
            context.is_user_triggered = false;
            url = next;
        }
    }

    /// Retry loop: retriable errors burn budget with backoff; a
    /// speculative-TLS failure earns one immediate non-speculative
    /// retry that doesn't count.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_with_retries(
        &self,
        method: &Method,
        url: &Url,
        context: &RequestContext,
        explicit: &[(String, String)],
        body: Option<Bytes>,
        tcp_proxy: &Option<ProxyConfig>,
        udp_proxy: &Option<ProxyConfig>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let mut attempt: u32 = 0;
        loop {
            cancel.check()?;
            let started = Instant::now();
            let result = self
                .attempt(method, url, context, explicit, body.clone(), tcp_proxy, udp_proxy, cancel)
                .await;

            match result {
                Ok(response) => {
                    // Bad statuses are classified through the same typed
                    // error the rest of the crate uses, so the retriable
                    // set lives in exactly one place. They burn budget
                    // only for idempotent methods; the response itself
                    // stays the caller's answer once the budget is gone.
                    let status_err = Error::HttpStatus {
                        status: response.status,
                    };
                    let idempotent =
                        matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
                    if status_err.retriability() == Retriability::Retriable
                        && idempotent
                        && attempt < self.options.retry_budget
                    {
                        attempt += 1;
                        tracing::debug!(status = response.status, attempt, "retrying HTTP status");
                        backoff(attempt, cancel).await?;
                        continue;
                    }
                    let mut response = response;
                    response.timing.total = started.elapsed();
                    return Ok(response);
                }
                Err(err) => {
                    if let Error::SpeculativeTls { op, status, .. } = &err {
                        // Blocklist this (proxy, protocol) and go again
                        // without speculation, once, for free.
                        if let Some(proxy) = tcp_proxy {
                            if self.arbiter.speculative_allowed(&proxy.key(), HttpVersion::H2) {
                                tracing::debug!(%op, ?status, "speculative TLS failed; retrying plainly");
                                self.arbiter.disable_speculative(&proxy.key(), HttpVersion::H2);
                                continue;
                            }
                        }
                    }

                    match err.retriability() {
                        Retriability::Retriable if attempt < self.options.retry_budget => {
                            attempt += 1;
                            tracing::debug!(error = %err, attempt, "retrying after error");
                            backoff(attempt, cancel).await?;
                        }
                        Retriability::FingerprintSuspect => {
                            tracing::warn!(
                                preset = self.preset.name,
                                origin = %origin_of(url),
                                "handshake rejection suggests a fingerprint mismatch"
                            );
                            return Err(err);
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    /// One end-to-end attempt: connection (pooled or fresh), request,
    /// response, pool return.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        context: &RequestContext,
        explicit: &[(String, String)],
        body: Option<Bytes>,
        tcp_proxy: &Option<ProxyConfig>,
        udp_proxy: &Option<ProxyConfig>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let origin = origin_of(url);
        let idempotent = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
        let allow_early = idempotent || self.options.allow_unsafe_early_data;

        let (mut conn, protocol, timing) = self
            .obtain_connection(url, &origin, tcp_proxy, udp_proxy, allow_early, cancel)
            .await?;

        let cookie_header = self.jar.cookie_header(url);
        let headers = assemble_headers(
            &self.preset,
            context,
            explicit,
            self.options.accept_language.as_deref(),
            cookie_header,
            self.options.tls_only,
        );

        let send_started = Instant::now();
        let result = conn
            .send_request(method.clone(), url, headers, body, &self.jar, cancel)
            .await;

        match result {
            Ok(mut response) => {
                self.arbiter.record_success(&origin, protocol);
                self.pool.checkin(
                    self.pool_key(&origin, protocol, tcp_proxy, udp_proxy),
                    conn,
                );
                response.timing = Timing {
                    first_byte: send_started.elapsed(),
                    ..timing
                };
                Ok(response)
            }
            Err(err) => {
                // The connection state is unknown; don't pool it.
                Err(err)
            }
        }
    }

    fn pool_key(
        &self,
        origin: &str,
        protocol: HttpVersion,
        tcp_proxy: &Option<ProxyConfig>,
        udp_proxy: &Option<ProxyConfig>,
    ) -> PoolKey {
        let proxy = match protocol {
            HttpVersion::H3 => udp_proxy.as_ref(),
            _ => tcp_proxy.as_ref(),
        };
        PoolKey {
            origin: origin.to_string(),
            protocol,
            preset: self.preset.name,
            proxy: proxy.map(|p| p.key()).unwrap_or_default(),
            session_id: self.options.session_id.clone(),
        }
    }

    /// Pool checkout or fresh dial per the arbiter's plan.
    async fn obtain_connection(
        &self,
        url: &Url,
        origin: &str,
        tcp_proxy: &Option<ProxyConfig>,
        udp_proxy: &Option<ProxyConfig>,
        allow_early_data: bool,
        cancel: &CancelToken,
    ) -> Result<(Connection, HttpVersion, Timing)> {
        let preset_has_h3 = self.preset.h3.is_some() && url.scheme() == "https";
        let forced = *self.forced.lock().expect("forced protocol lock poisoned");
        let plan = self.arbiter.plan(origin, forced, preset_has_h3);

        // Any pooled connection satisfying the plan wins outright.
        for protocol in plan_protocols(plan) {
            let key = self.pool_key(origin, protocol, tcp_proxy, udp_proxy);
            if let Some(conn) = self.pool.checkout(&key) {
                return Ok((conn, protocol, Timing::default()));
            }
        }

        // Reserve a dial placeholder instead of holding any pool lock
        // across the handshake. If another task is already dialing this
        // origin, give it a beat and re-check the pool — a multiplexed
        // connection it lands can carry this request too.
        let guard_key = self.pool_key(origin, HttpVersion::H2, tcp_proxy, udp_proxy);
        let reserved = self.pool.try_reserve(&guard_key);
        if !reserved {
            tokio::time::sleep(Duration::from_millis(25)).await;
            for protocol in plan_protocols(plan) {
                let key = self.pool_key(origin, protocol, tcp_proxy, udp_proxy);
                if let Some(conn) = self.pool.checkout(&key) {
                    return Ok((conn, protocol, Timing::default()));
                }
            }
        }

        let dial_started = Instant::now();
        let result = match plan {
            DialPlan::Forced(HttpVersion::H3) => {
                self.connect_h3(url, origin, udp_proxy, allow_early_data, cancel)
                    .await
                    .map(|c| (c, HttpVersion::H3))
            }
            DialPlan::Forced(HttpVersion::H1) => self
                .connect_tcp(url, origin, tcp_proxy, AlpnMode::H1Only, cancel)
                .await,
            DialPlan::Forced(HttpVersion::H2) => self
                .connect_tcp(url, origin, tcp_proxy, AlpnMode::H2Only, cancel)
                .await,
            DialPlan::Forced(HttpVersion::Auto) | DialPlan::TcpOnly => self
                .connect_tcp(url, origin, tcp_proxy, AlpnMode::PresetDefault, cancel)
                .await,
            DialPlan::RaceH3 => {
                self.race(url, origin, tcp_proxy, udp_proxy, allow_early_data, cancel)
                    .await
            }
        };

        if reserved {
            self.pool.release_reservation(&guard_key);
        }

        let (conn, protocol) = result?;
        let timing = Timing {
            connect: dial_started.elapsed(),
            ..Timing::default()
        };
        Ok((conn, protocol, timing))
    }

    /// Race H3 against TCP with the H3 head start. The first successful
    /// connection wins; the loser future is dropped (its cancellation
    /// is cooperative at every await point).
    async fn race(
        &self,
        url: &Url,
        origin: &str,
        tcp_proxy: &Option<ProxyConfig>,
        udp_proxy: &Option<ProxyConfig>,
        allow_early_data: bool,
        cancel: &CancelToken,
    ) -> Result<(Connection, HttpVersion)> {
        let h3 = self.connect_h3(url, origin, udp_proxy, allow_early_data, cancel);
        let tcp = async {
            tokio::time::sleep(H3_HEAD_START).await;
            self.connect_tcp(url, origin, tcp_proxy, AlpnMode::PresetDefault, cancel)
                .await
        };
        tokio::pin!(h3);
        tokio::pin!(tcp);

        tokio::select! {
            h3_result = &mut h3 => match h3_result {
                Ok(conn) => Ok((conn, HttpVersion::H3)),
                Err(err) => {
                    tracing::debug!(error = %err, "H3 lost the race");
                    self.arbiter.record_h3_failure(origin);
                    tcp.await
                }
            },
            tcp_result = &mut tcp => match tcp_result {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    tracing::debug!(error = %err, "TCP dial failed; waiting on H3");
                    h3.await.map(|c| (c, HttpVersion::H3)).map_err(|h3_err| {
                        self.arbiter.record_h3_failure(origin);
                        // The TCP error is usually the more actionable
                        // of the two.
                        tracing::debug!(error = %h3_err, "H3 also failed");
                        err
                    })
                }
            },
        }
    }

    /// TCP → (speculative) TLS → ALPN → H1/H2.
    async fn connect_tcp(
        &self,
        url: &Url,
        origin: &str,
        tcp_proxy: &Option<ProxyConfig>,
        alpn: AlpnMode,
        cancel: &CancelToken,
    ) -> Result<(Connection, HttpVersion)> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::configuration("URL has no host"))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let link = match tcp_proxy {
            None => {
                let opts = DialOptions {
                    local_bind: self.options.local_bind,
                    connect_timeout: Some(self.options.connect_timeout),
                };
                let (stream, _addr) = dial::dial_first(host, port, &opts, cancel).await?;
                TcpLink::Plain(stream)
            }
            Some(proxy) => {
                let speculative = url.scheme() == "https"
                    && self.arbiter.speculative_allowed(&proxy.key(), HttpVersion::H2);
                let target = Target::Domain(host.to_string(), port);
                match proxy::dial_tcp(
                    Some(proxy),
                    &target,
                    self.options.connect_timeout,
                    speculative,
                )
                .await?
                {
                    TcpTunnel::Ready(stream) => TcpLink::Plain(stream),
                    TcpTunnel::SpeculativeConnect {
                        stream,
                        connect_request,
                    } => TcpLink::Speculative(SpeculativeStream::new(stream, connect_request)),
                }
            }
        };

        if url.scheme() != "https" {
            return Ok((
                Connection::H1(H1Connection::new(MaybeTlsStream::Plain(link))),
                HttpVersion::H1,
            ));
        }

        let tls_stream = tokio::select! {
            result = self.tls.handshake(link, host, alpn) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let stream = MaybeTlsStream::Tls(Box::new(tls_stream));

        if stream.is_h2() {
            let grease = {
                let mut draw = self.grease.lock().expect("grease lock poisoned");
                Some((draw.next_u16(), 0))
            };
            let handle = h2::dial(stream, &self.preset.h2, grease, origin).await?;
            Ok((Connection::H2(handle), HttpVersion::H2))
        } else {
            Ok((
                Connection::H1(H1Connection::new(stream)),
                HttpVersion::H1,
            ))
        }
    }

    /// UDP path → QUIC/H3.
    async fn connect_h3(
        &self,
        url: &Url,
        origin: &str,
        udp_proxy: &Option<ProxyConfig>,
        allow_early_data: bool,
        cancel: &CancelToken,
    ) -> Result<Connection> {
        let Some(h3_spec) = &self.preset.h3 else {
            return Err(Error::Http3Unavailable {
                origin: origin.to_string(),
                reason: "preset does not speak HTTP/3".to_string(),
            });
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::configuration("URL has no host"))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let addr = dial::resolve(host, port)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DnsFailed {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            })?;

        let pconn = proxy::dial_udp(udp_proxy.as_ref(), addr, self.options.connect_timeout).await?;
        let handle = h3::dial(
            host,
            origin.to_string(),
            pconn,
            h3_spec,
            self.preset.h2.pseudo_order,
            self.preset.name,
            self.tickets.clone(),
            crate::keylog::resolve_sink(&self.options.key_log),
            allow_early_data,
            self.options.connect_timeout,
            cancel,
        )
        .await?;
        Ok(Connection::H3(handle))
    }
}

fn origin_of(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(443)
    )
}

fn plan_protocols(plan: DialPlan) -> Vec<HttpVersion> {
    match plan {
        DialPlan::Forced(v) if v != HttpVersion::Auto => vec![v],
        DialPlan::RaceH3 => vec![HttpVersion::H3, HttpVersion::H2, HttpVersion::H1],
        _ => vec![HttpVersion::H2, HttpVersion::H1],
    }
}

/// Exponential backoff with jitter, cancellable.
async fn backoff(attempt: u32, cancel: &CancelToken) -> Result<()> {
    let base = Duration::from_millis(250) * 2u32.pow(attempt.min(5));
    let mut jitter = [0u8; 1];
    let _ = getrandom::getrandom(&mut jitter);
    let delay = base + Duration::from_millis(u64::from(jitter[0]) / 2);
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Materialize a streaming request body (the dialers frame bodies from
/// a buffer; upload backpressure happens at the channel feeding this).
async fn collect_stream(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> Result<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_protocol_preference_order() {
        assert_eq!(
            plan_protocols(DialPlan::RaceH3),
            vec![HttpVersion::H3, HttpVersion::H2, HttpVersion::H1]
        );
        assert_eq!(
            plan_protocols(DialPlan::TcpOnly),
            vec![HttpVersion::H2, HttpVersion::H1]
        );
        assert_eq!(
            plan_protocols(DialPlan::Forced(HttpVersion::H3)),
            vec![HttpVersion::H3]
        );
    }

    #[test]
    fn origin_includes_default_port() {
        let url = Url::parse("https://example.test/a").unwrap();
        assert_eq!(origin_of(&url), "example.test:443");
        let url = Url::parse("http://example.test/a").unwrap();
        assert_eq!(origin_of(&url), "example.test:80");
    }

    #[tokio::test]
    async fn backoff_is_cancellable() {
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(backoff(3, &cancel).await, Err(Error::Cancelled)));
    }
}
