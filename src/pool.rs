//! Connection pool.
//!
//! Keyed by (origin, protocol, preset, proxy, session identifier) so a
//! connection is only ever reused for traffic that would have produced
//! an identical fingerprint. HTTP/1.1 entries are single-use serial;
//! HTTP/2 and HTTP/3 entries are multiplexed handles counted by
//! in-flight streams.
//!
//! The pool lock is a plain mutex held only for map operations — never
//! across a handshake. Dialers that want singleflight behavior reserve
//! a key first and release it once the connection is installed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::transport::h1::H1Connection;
use crate::transport::h2::H2Handle;
use crate::transport::h3::H3Handle;
use crate::transport::Connection;
use crate::version::HttpVersion;

/// Pool partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub origin: String,
    pub protocol: HttpVersion,
    pub preset: &'static str,
    /// Proxy identity (scheme://host:port) or empty for direct.
    pub proxy: String,
    /// Session identifier when several logical identities share a
    /// process.
    pub session_id: Option<String>,
}

enum Pooled {
    H1(Box<H1Connection>),
    H2(H2Handle),
    H3(H3Handle),
}

impl Pooled {
    fn is_open(&self) -> bool {
        match self {
            Pooled::H1(c) => c.is_reusable(),
            Pooled::H2(h) => h.is_open(),
            Pooled::H3(h) => h.is_open(),
        }
    }

    fn in_flight(&self) -> usize {
        match self {
            Pooled::H1(_) => 0,
            Pooled::H2(h) => h.in_flight(),
            Pooled::H3(h) => h.in_flight(),
        }
    }
}

struct Entry {
    conn: Pooled,
    last_used: Instant,
}

struct PoolInner {
    entries: HashMap<PoolKey, Vec<Entry>>,
    /// Keys currently being dialed (placeholder reservations).
    pending: HashSet<PoolKey>,
}

/// Per-session connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<PoolInner>>,
    max_idle: Duration,
    max_per_key: usize,
}

const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(90);
const DEFAULT_MAX_PER_KEY: usize = 6;

/// Poll interval while draining in-flight streams.
const DRAIN_POLL: Duration = Duration::from_millis(20);

impl Default for Pool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE, DEFAULT_MAX_PER_KEY)
    }
}

impl Pool {
    pub fn new(max_idle: Duration, max_per_key: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: HashMap::new(),
                pending: HashSet::new(),
            })),
            max_idle,
            max_per_key,
        }
    }

    /// Take a connection for this key, if one is alive.
    ///
    /// H1 connections leave the pool (strictly serial); H2/H3 handles
    /// are cloned out and the entry stays for other requests.
    pub fn checkout(&self, key: &PoolKey) -> Option<Connection> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let entries = inner.entries.get_mut(key)?;
        entries.retain(|e| e.conn.is_open() && e.last_used.elapsed() < self.max_idle);

        match key.protocol {
            HttpVersion::H1 => {
                let entry = entries.pop()?;
                match entry.conn {
                    Pooled::H1(conn) => Some(Connection::H1(*conn)),
                    _ => None,
                }
            }
            _ => {
                let entry = entries.first_mut()?;
                entry.last_used = Instant::now();
                match &entry.conn {
                    Pooled::H2(h) => Some(Connection::H2(h.clone())),
                    Pooled::H3(h) => Some(Connection::H3(h.clone())),
                    Pooled::H1(_) => None,
                }
            }
        }
    }

    /// Return (or install) a connection. A connection that reports
    /// itself unusable is dropped instead.
    pub fn checkin(&self, key: PoolKey, conn: Connection) {
        let pooled = match conn {
            Connection::H1(c) => {
                if !c.is_reusable() {
                    return;
                }
                Pooled::H1(Box::new(c))
            }
            Connection::H2(h) => {
                if !h.is_open() {
                    return;
                }
                Pooled::H2(h)
            }
            Connection::H3(h) => {
                if !h.is_open() {
                    return;
                }
                Pooled::H3(h)
            }
        };

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let entries = inner.entries.entry(key).or_default();

        // Multiplexed entries are shared handles; avoid stacking
        // duplicates of the same connection.
        if matches!(pooled, Pooled::H2(_) | Pooled::H3(_)) && !entries.is_empty() {
            entries[0].last_used = Instant::now();
            return;
        }

        if entries.len() >= self.max_per_key {
            // LRU pressure: drop the stalest idle entry.
            if let Some(idx) = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.conn.in_flight() == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
            {
                entries.remove(idx);
            } else {
                return; // everything busy; let the new conn drop
            }
        }
        entries.push(Entry {
            conn: pooled,
            last_used: Instant::now(),
        });
    }

    /// Reserve a key before dialing so concurrent requests don't all
    /// open new connections. Returns false when someone else is already
    /// dialing it.
    pub fn try_reserve(&self, key: &PoolKey) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.pending.insert(key.clone())
    }

    pub fn release_reservation(&self, key: &PoolKey) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.pending.remove(key);
    }

    /// Total in-flight streams across all pooled connections.
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .entries
            .values()
            .flatten()
            .map(|e| e.conn.in_flight())
            .sum()
    }

    /// Drop expired/broken entries.
    pub fn evict_idle(&self) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        for entries in inner.entries.values_mut() {
            entries.retain(|e| e.conn.is_open() && e.last_used.elapsed() < self.max_idle);
        }
        inner.entries.retain(|_, v| !v.is_empty());
    }

    /// Close every pooled connection, waiting for in-flight streams to
    /// complete up to `deadline`. A connection still busy past the
    /// deadline is abandoned to finish (or fail) in its driver task, so
    /// the caller is never blocked indefinitely.
    pub async fn close_with_timeout(&self, deadline: Duration) {
        let started = Instant::now();
        while self.in_flight() > 0 && started.elapsed() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let abandoned = self.in_flight();
        if abandoned > 0 {
            tracing::warn!(abandoned, "closing pool with streams still in flight");
        }
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.entries.clear();
        inner.pending.clear();
    }
}
