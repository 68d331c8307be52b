//! Request values and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::headers::RequestContext;

/// Cooperative cancellation token. Cloning shares the token; cancelling
/// any clone wakes every pending wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the token is cancelled. Suitable for `select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after registering to close the notify race.
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Fail fast when already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Request body: nothing, an in-memory buffer, or a bounded stream of
/// chunks for large uploads.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Lazily produced chunks; channel bound provides upload backpressure.
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Length when known up front (drives Content-Length vs chunked).
    pub fn known_len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            Body::Stream(_) => None,
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

/// A request value handed to the session.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Caller-supplied headers in insertion order. They override
    /// template slots by value while keeping template order.
    pub headers: Vec<(String, String)>,
    pub body: Body,
    /// Per-request total deadline overriding the session default.
    pub timeout: Option<Duration>,
    /// Navigation/fetch context driving header coherence. Defaults to a
    /// user-triggered navigation.
    pub context: RequestContext,
    pub cancel: CancelToken,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::configuration(format!(
                    "unsupported URL scheme {other:?}"
                )))
            }
        }
        Ok(Self {
            method,
            url,
            headers: Vec::new(),
            body: Body::Empty,
            timeout: None,
            context: RequestContext::navigation(),
            cancel: CancelToken::new(),
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// GET, HEAD and OPTIONS are safe to replay and to promote into
    /// 0-RTT early data.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// "host:port" origin key for pools and hint maps.
    pub fn origin(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(443);
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        assert!(Request::get("ftp://example.test/").is_err());
        assert!(Request::get("https://example.test/").is_ok());
    }

    #[test]
    fn idempotency_classification() {
        assert!(Request::get("https://a.test/").unwrap().is_idempotent());
        assert!(Request::new(Method::HEAD, "https://a.test/")
            .unwrap()
            .is_idempotent());
        assert!(!Request::post("https://a.test/").unwrap().is_idempotent());
    }

    #[test]
    fn origin_includes_default_port() {
        assert_eq!(
            Request::get("https://a.test/x").unwrap().origin(),
            "a.test:443"
        );
        assert_eq!(
            Request::get("http://a.test:8080/").unwrap().origin(),
            "a.test:8080"
        );
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.check().is_err());
    }
}
