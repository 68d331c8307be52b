//! Transport layer: the shared dial prelude, the fingerprinting TLS
//! connector, and the three protocol dialers (HTTP/1.1, HTTP/2,
//! HTTP/3).
//!
//! All three dialers share one contract: given an origin, a proxy
//! configuration, a preset and the session's ticket cache, produce a
//! fingerprint-correct connection ready for requests. Failures are
//! classified (retriable / fatal / fingerprint-suspect) but never
//! retried here; retrying is the arbiter's and engine's job.

pub mod dial;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod speculative;
pub mod tls;

use crate::cookie::CookieJar;
use crate::error::Result;
use crate::request::CancelToken;
use bytes::Bytes;
use http::Method;
use url::Url;

use crate::response::Response;

/// An established connection of any protocol, as stored in the pool.
pub enum Connection {
    H1(h1::H1Connection),
    H2(h2::H2Handle),
    H3(h3::H3Handle),
}

impl Connection {
    /// Send a request on this connection. Ordered headers are emitted
    /// verbatim; `jar` receives response cookies once the body is done.
    pub async fn send_request(
        &mut self,
        method: Method,
        url: &Url,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        jar: &CookieJar,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let response = match self {
            Connection::H1(conn) => conn.send_request(method, url, headers, body, cancel).await?,
            Connection::H2(handle) => handle.send_request(method, url, headers, body, cancel).await?,
            Connection::H3(handle) => handle.send_request(method, url, headers, body, cancel).await?,
        };
        // The jar is updated only after the body is fully received, so
        // a request started mid-response never sees partial state.
        jar.store_response_cookies(response.header_all("set-cookie").into_iter(), url);
        Ok(response)
    }

    /// Whether this connection can be returned to the pool.
    pub fn is_reusable(&self) -> bool {
        match self {
            Connection::H1(conn) => conn.is_reusable(),
            Connection::H2(handle) => handle.is_open(),
            Connection::H3(handle) => handle.is_open(),
        }
    }
}
