//! # wraith
//!
//! HTTP client whose network fingerprint is byte-faithful to a real
//! browser across every layer: the TLS ClientHello (JA3/JA4), the
//! HTTP/2 connection preamble (Akamai fingerprint), the QUIC transport
//! parameters, and the exact order and contents of request headers —
//! while keeping the ergonomics of an ordinary client: sessions,
//! cookies, redirects, retries, proxies and persistent session state.
//!
//! ```no_run
//! use wraith::Session;
//!
//! # async fn example() -> wraith::Result<()> {
//! let session = Session::new("chrome-143-linux")?;
//! let mut response = session.get("https://example.test/").await?;
//! println!("{} via {}", response.status, response.protocol);
//! println!("{}", response.text().await?);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod keylog;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;
pub mod version;

pub use cookie::{Cookie, CookieJar, SameSite};
pub use error::{Error, Result, Retriability};
pub use fingerprint::headers::RequestContext;
pub use fingerprint::{registry, Preset};
pub use request::{Body, CancelToken, Request};
pub use response::{Response, Timing};
pub use session::state::SessionState;
pub use session::ticket::{TicketBackend, TicketCache, TicketRecord};
pub use session::{Session, SessionBuilder};
pub use version::HttpVersion;
