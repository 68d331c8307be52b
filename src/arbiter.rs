//! Protocol arbiter: decides H3 vs H2/H1 per request and remembers how
//! origins behaved.
//!
//! Hints are purely advisory — losing them costs a round trip or a
//! failed race, never correctness. A failed H3 attempt pins the origin
//! to TCP for a cooldown window; cooldowns survive `save`/`load` as a
//! remaining-seconds value.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::version::HttpVersion;

/// Head start H3 gets in a race before H2 dialing begins.
pub const H3_HEAD_START: Duration = Duration::from_millis(200);

/// How long a failed H3 origin stays pinned to TCP.
pub const DEFAULT_H3_COOLDOWN: Duration = Duration::from_secs(300);

/// What the engine should do for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPlan {
    /// The session forces one protocol; obey.
    Forced(HttpVersion),
    /// Race H3 (with head start) against TCP (H2/H1 by ALPN).
    RaceH3,
    /// Dial TCP only; ALPN picks H2 or H1.
    TcpOnly,
}

/// Per-(origin, preset) learned state.
#[derive(Debug, Clone, Default)]
struct Hint {
    last_good: Option<HttpVersion>,
    h3_cooldown_until: Option<Instant>,
    /// Origin advertised h3 via Alt-Svc.
    alt_svc_h3: bool,
}

/// Serialized form of a hint for the session state blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintState {
    pub origin: String,
    pub last_good: Option<HttpVersion>,
    /// Seconds of H3 cooldown left at save time.
    #[serde(default)]
    pub h3_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub alt_svc_h3: bool,
}

/// The arbiter. Cloning shares state (engine and dialers feed the same
/// hint map).
#[derive(Clone, Default)]
pub struct Arbiter {
    hints: Arc<Mutex<HashMap<String, Hint>>>,
    /// (proxy key, protocol) pairs where speculative TLS is disabled
    /// after a SpeculativeTls failure.
    speculative_blocklist: Arc<Mutex<HashSet<(String, HttpVersion)>>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the dial plan for an origin.
    pub fn plan(&self, origin: &str, forced: HttpVersion, preset_has_h3: bool) -> DialPlan {
        if forced != HttpVersion::Auto {
            return DialPlan::Forced(forced);
        }
        if !preset_has_h3 {
            return DialPlan::TcpOnly;
        }

        let hints = self.hints.lock().expect("arbiter lock poisoned");
        let Some(hint) = hints.get(origin) else {
            return DialPlan::TcpOnly;
        };
        if let Some(until) = hint.h3_cooldown_until {
            if until > Instant::now() {
                return DialPlan::TcpOnly;
            }
        }
        if hint.last_good == Some(HttpVersion::H3) || hint.alt_svc_h3 {
            DialPlan::RaceH3
        } else {
            DialPlan::TcpOnly
        }
    }

    /// Record a successful connection.
    pub fn record_success(&self, origin: &str, protocol: HttpVersion) {
        let mut hints = self.hints.lock().expect("arbiter lock poisoned");
        let hint = hints.entry(origin.to_string()).or_default();
        hint.last_good = Some(protocol);
        if protocol == HttpVersion::H3 {
            hint.h3_cooldown_until = None;
        }
    }

    /// Record an H3 establishment failure: pin the origin to TCP for
    /// the cooldown window.
    pub fn record_h3_failure(&self, origin: &str) {
        let mut hints = self.hints.lock().expect("arbiter lock poisoned");
        let hint = hints.entry(origin.to_string()).or_default();
        hint.h3_cooldown_until = Some(Instant::now() + DEFAULT_H3_COOLDOWN);
        if hint.last_good == Some(HttpVersion::H3) {
            hint.last_good = Some(HttpVersion::H2);
        }
        tracing::debug!(origin, "H3 pinned to cooldown");
    }

    /// Ingest an Alt-Svc response header for an origin.
    pub fn record_alt_svc(&self, origin: &str, header: &str) {
        if header.trim() == "clear" {
            let mut hints = self.hints.lock().expect("arbiter lock poisoned");
            if let Some(hint) = hints.get_mut(origin) {
                hint.alt_svc_h3 = false;
            }
            return;
        }
        if alt_svc_advertises_h3(header) {
            let mut hints = self.hints.lock().expect("arbiter lock poisoned");
            hints.entry(origin.to_string()).or_default().alt_svc_h3 = true;
        }
    }

    // --- speculative TLS blocklist -------------------------------------

    pub fn speculative_allowed(&self, proxy_key: &str, protocol: HttpVersion) -> bool {
        !self
            .speculative_blocklist
            .lock()
            .expect("blocklist lock poisoned")
            .contains(&(proxy_key.to_string(), protocol))
    }

    pub fn disable_speculative(&self, proxy_key: &str, protocol: HttpVersion) {
        tracing::debug!(proxy = proxy_key, %protocol, "disabling speculative TLS");
        self.speculative_blocklist
            .lock()
            .expect("blocklist lock poisoned")
            .insert((proxy_key.to_string(), protocol));
    }

    // --- persistence ----------------------------------------------------

    pub fn export(&self) -> Vec<HintState> {
        let now = Instant::now();
        self.hints
            .lock()
            .expect("arbiter lock poisoned")
            .iter()
            .map(|(origin, hint)| HintState {
                origin: origin.clone(),
                last_good: hint.last_good,
                h3_cooldown_secs: hint
                    .h3_cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_secs()),
                alt_svc_h3: hint.alt_svc_h3,
            })
            .collect()
    }

    pub fn import(&self, states: Vec<HintState>) {
        let now = Instant::now();
        let mut hints = self.hints.lock().expect("arbiter lock poisoned");
        hints.clear();
        for state in states {
            hints.insert(
                state.origin,
                Hint {
                    last_good: state.last_good,
                    h3_cooldown_until: state
                        .h3_cooldown_secs
                        .map(|secs| now + Duration::from_secs(secs)),
                    alt_svc_h3: state.alt_svc_h3,
                },
            );
        }
    }
}

/// Minimal Alt-Svc (RFC 7838) scan: does any alternative speak h3?
fn alt_svc_advertises_h3(header: &str) -> bool {
    header.split(',').any(|alt| {
        let alt = alt.trim();
        let Some((protocol, _)) = alt.split_once('=') else {
            return false;
        };
        let protocol = protocol.trim();
        protocol == "h3" || protocol.starts_with("h3-")
    })
}
