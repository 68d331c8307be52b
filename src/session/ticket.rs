//! TLS session ticket cache.
//!
//! Tickets are keyed by (origin, preset, protocol) — resuming with a
//! ticket minted under a different fingerprint would itself be a
//! detectable anomaly — plus an optional session identifier that
//! isolates logical identities sharing one backend.
//!
//! A cache can be mirrored to a [`TicketBackend`] so resumption works
//! across restarts and across cluster nodes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which handshake the ticket came from. H2 covers the TCP/TLS stack
/// (HTTP/1.1 included); H3 tickets live in QUIC session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketProtocol {
    H2,
    H3,
}

impl TicketProtocol {
    fn as_str(&self) -> &'static str {
        match self {
            TicketProtocol::H2 => "h2",
            TicketProtocol::H3 => "h3",
        }
    }
}

/// One cached session ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Opaque serialized session (BoringSSL DER or quiche session
    /// state).
    pub blob: Vec<u8>,
    /// Absolute expiry; expired records are evicted on access.
    pub expires_at: DateTime<Utc>,
    /// Max early data the server advertised (0 disables 0-RTT).
    pub max_early_data: u32,
    /// ECH config in effect when the ticket was minted. Resumption must
    /// present the same config.
    pub ech_config: Option<Vec<u8>>,
}

impl TicketRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Pluggable shared storage for tickets (e.g. Redis across a cluster).
/// Implementations must be cheap; heavy I/O belongs on their own
/// executor.
pub trait TicketBackend: Send + Sync {
    fn load(&self, key: &str) -> Option<TicketRecord>;
    fn store(&self, key: &str, record: &TicketRecord);
    fn remove(&self, key: &str);
}

type BackendSlot = Option<(Arc<dyn TicketBackend>, Arc<dyn Fn(String) + Send + Sync>)>;

/// Default ticket lifetime when the server does not bound it earlier.
const DEFAULT_TICKET_LIFETIME_HOURS: i64 = 24;

/// Session ticket cache. Cloning shares the store (forks share
/// tickets).
#[derive(Clone)]
pub struct TicketCache {
    inner: Arc<RwLock<HashMap<String, TicketRecord>>>,
    backend: Arc<RwLock<BackendSlot>>,
    /// Isolates this cache's keys inside a shared backend.
    session_id: Option<String>,
}

impl Default for TicketCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TicketCache {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            backend: Arc::new(RwLock::new(None)),
            session_id,
        }
    }

    fn key(&self, origin: &str, preset: &str, proto: TicketProtocol) -> String {
        match &self.session_id {
            Some(id) => format!("{origin}|{preset}|{}|{id}", proto.as_str()),
            None => format!("{origin}|{preset}|{}", proto.as_str()),
        }
    }

    /// Insert a ticket with the default lifetime.
    pub fn put(&self, origin: &str, preset: &str, proto: TicketProtocol, blob: Vec<u8>) {
        self.put_record(
            origin,
            preset,
            proto,
            TicketRecord {
                blob,
                expires_at: Utc::now() + Duration::hours(DEFAULT_TICKET_LIFETIME_HOURS),
                max_early_data: 0,
                ech_config: None,
            },
        );
    }

    /// Insert a fully specified record.
    pub fn put_record(
        &self,
        origin: &str,
        preset: &str,
        proto: TicketProtocol,
        record: TicketRecord,
    ) {
        let key = self.key(origin, preset, proto);
        {
            let mut map = self.inner.write().expect("ticket cache lock poisoned");
            map.insert(key.clone(), record.clone());
        }
        if let Some((backend, on_error)) = self.backend.read().expect("backend lock").clone() {
            // Backend faults must not break the handshake path.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                backend.store(&key, &record)
            }));
            if result.is_err() {
                on_error(format!("ticket backend store failed for {key}"));
            }
        }
    }

    /// Fetch a live ticket; expired entries are evicted, a local miss
    /// falls through to the backend.
    pub fn get(&self, origin: &str, preset: &str, proto: TicketProtocol) -> Option<TicketRecord> {
        let key = self.key(origin, preset, proto);
        {
            let map = self.inner.read().expect("ticket cache lock poisoned");
            if let Some(record) = map.get(&key) {
                if !record.is_expired() {
                    return Some(record.clone());
                }
            }
        }
        // Evict if expired.
        {
            let mut map = self.inner.write().expect("ticket cache lock poisoned");
            if let Some(record) = map.get(&key) {
                if record.is_expired() {
                    map.remove(&key);
                }
            }
        }

        let backend = self.backend.read().expect("backend lock").clone();
        if let Some((backend, _)) = backend {
            if let Some(record) = backend.load(&key) {
                if !record.is_expired() {
                    let mut map = self.inner.write().expect("ticket cache lock poisoned");
                    map.insert(key, record.clone());
                    return Some(record);
                }
            }
        }
        None
    }

    pub fn remove(&self, origin: &str, preset: &str, proto: TicketProtocol) {
        let key = self.key(origin, preset, proto);
        self.inner
            .write()
            .expect("ticket cache lock poisoned")
            .remove(&key);
        if let Some((backend, _)) = self.backend.read().expect("backend lock").clone() {
            backend.remove(&key);
        }
    }

    /// Whether a shared backend persists this cache's records.
    pub fn has_backend(&self) -> bool {
        self.backend.read().expect("backend lock").is_some()
    }

    /// Register a shared backend. `on_error` observes backend faults.
    pub fn register_backend(
        &self,
        backend: Arc<dyn TicketBackend>,
        on_error: Arc<dyn Fn(String) + Send + Sync>,
    ) {
        *self.backend.write().expect("backend lock") = Some((backend, on_error));
    }

    /// Drop all local entries (used on session close when no backend
    /// persists them).
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("ticket cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("ticket cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export live records for the state blob.
    pub fn export(&self) -> Vec<(String, TicketRecord)> {
        self.inner
            .read()
            .expect("ticket cache lock poisoned")
            .iter()
            .filter(|(_, r)| !r.is_expired())
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    /// Import records from a state blob, replacing current contents.
    pub fn import(&self, records: Vec<(String, TicketRecord)>) {
        let mut map = self.inner.write().expect("ticket cache lock poisoned");
        map.clear();
        for (k, r) in records {
            if !r.is_expired() {
                map.insert(k, r);
            }
        }
    }
}

/// ECH configuration cache, per domain. The config that minted a ticket
/// must be re-presented on resumption, so these persist alongside
/// tickets in the state blob.
#[derive(Debug, Clone, Default)]
pub struct EchConfigCache {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl EchConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .expect("ech cache lock poisoned")
            .get(domain)
            .cloned()
    }

    pub fn put(&self, domain: &str, config: Vec<u8>) {
        self.inner
            .write()
            .expect("ech cache lock poisoned")
            .insert(domain.to_string(), config);
    }

    pub fn export(&self) -> HashMap<String, Vec<u8>> {
        self.inner.read().expect("ech cache lock poisoned").clone()
    }

    pub fn import(&self, configs: HashMap<String, Vec<u8>>) {
        *self.inner.write().expect("ech cache lock poisoned") = configs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let cache = TicketCache::new(None);
        cache.put("example.test:443", "chrome-143-linux", TicketProtocol::H2, vec![1, 2, 3]);
        let record = cache
            .get("example.test:443", "chrome-143-linux", TicketProtocol::H2)
            .unwrap();
        assert_eq!(record.blob, vec![1, 2, 3]);
        assert!(cache
            .get("other.test:443", "chrome-143-linux", TicketProtocol::H2)
            .is_none());
    }

    #[test]
    fn preset_and_protocol_isolate_keys() {
        let cache = TicketCache::new(None);
        cache.put("a.test:443", "chrome-143-linux", TicketProtocol::H2, vec![1]);
        assert!(cache.get("a.test:443", "firefox-133", TicketProtocol::H2).is_none());
        assert!(cache.get("a.test:443", "chrome-143-linux", TicketProtocol::H3).is_none());
    }

    #[test]
    fn expired_records_evict_on_access() {
        let cache = TicketCache::new(None);
        cache.put_record(
            "a.test:443",
            "chrome-143-linux",
            TicketProtocol::H3,
            TicketRecord {
                blob: vec![9],
                expires_at: Utc::now() - Duration::seconds(1),
                max_early_data: 16384,
                ech_config: None,
            },
        );
        assert!(cache.get("a.test:443", "chrome-143-linux", TicketProtocol::H3).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn session_id_isolates_shared_backend_keys() {
        let a = TicketCache::new(Some("tenant-a".to_string()));
        let b = TicketCache::new(Some("tenant-b".to_string()));
        assert_ne!(
            a.key("x.test:443", "p", TicketProtocol::H2),
            b.key("x.test:443", "p", TicketProtocol::H2)
        );
    }

    #[test]
    fn backend_fallback_on_local_miss() {
        struct MapBackend(std::sync::Mutex<HashMap<String, TicketRecord>>);
        impl TicketBackend for MapBackend {
            fn load(&self, key: &str) -> Option<TicketRecord> {
                self.0.lock().unwrap().get(key).cloned()
            }
            fn store(&self, key: &str, record: &TicketRecord) {
                self.0.lock().unwrap().insert(key.to_string(), record.clone());
            }
            fn remove(&self, key: &str) {
                self.0.lock().unwrap().remove(key);
            }
        }

        let backend = Arc::new(MapBackend(std::sync::Mutex::new(HashMap::new())));
        let writer = TicketCache::new(None);
        writer.register_backend(backend.clone(), Arc::new(|_| {}));
        writer.put("a.test:443", "p", TicketProtocol::H2, vec![7]);

        // A fresh cache sharing the backend sees the ticket.
        let reader = TicketCache::new(None);
        reader.register_backend(backend, Arc::new(|_| {}));
        assert_eq!(
            reader.get("a.test:443", "p", TicketProtocol::H2).unwrap().blob,
            vec![7]
        );
    }

    #[test]
    fn export_import_round_trip() {
        let cache = TicketCache::new(None);
        cache.put("a.test:443", "p", TicketProtocol::H2, vec![1]);
        cache.put("b.test:443", "p", TicketProtocol::H3, vec![2]);

        let exported = cache.export();
        let restored = TicketCache::new(None);
        restored.import(exported);
        assert_eq!(restored.len(), 2);
        assert!(restored.get("a.test:443", "p", TicketProtocol::H2).is_some());
    }
}
