//! Versioned session state blob.
//!
//! Everything a session needs to resume elsewhere: cookies, TLS/QUIC
//! session tickets keyed by origin, the ECH configs they were minted
//! under, the arbiter's learned hints, and the forced-protocol flag.
//! Serialized as self-describing JSON with a leading version integer;
//! files are written with owner-only permissions because tickets are
//! bearer credentials.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arbiter::HintState;
use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::session::ticket::TicketRecord;
use crate::version::HttpVersion;

/// Current blob format version. Loading anything older (or unknown) is
/// rejected; newer blobs load best-effort with unknown fields ignored.
pub const STATE_VERSION: u32 = 4;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub preset: String,
    #[serde(default)]
    pub forced_protocol: HttpVersion,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Ticket records keyed by the cache's composite key.
    #[serde(default)]
    pub tickets: Vec<(String, TicketRecord)>,
    /// domain → base64 ECH config.
    #[serde(default)]
    pub ech_configs: HashMap<String, String>,
    #[serde(default)]
    pub arbiter_hints: Vec<HintState>,
}

impl SessionState {
    pub fn new(preset: &str) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            created_at: now,
            updated_at: now,
            preset: preset.to_string(),
            forced_protocol: HttpVersion::Auto,
            cookies: Vec::new(),
            tickets: Vec::new(),
            ech_configs: HashMap::new(),
            arbiter_hints: Vec::new(),
        }
    }

    pub fn encode_ech_configs(configs: HashMap<String, Vec<u8>>) -> HashMap<String, String> {
        configs
            .into_iter()
            .map(|(domain, config)| (domain, BASE64.encode(config)))
            .collect()
    }

    pub fn decode_ech_configs(&self) -> HashMap<String, Vec<u8>> {
        self.ech_configs
            .iter()
            .filter_map(|(domain, b64)| {
                BASE64
                    .decode(b64)
                    .ok()
                    .map(|config| (domain.clone(), config))
            })
            .collect()
    }

    /// Serialize and write with restrictive permissions.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let path = path.as_ref();
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(&json)?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(path, &json)?;
        }
        Ok(())
    }

    /// Load and version-check a state blob.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read(path.as_ref())?;
        let state: SessionState = serde_json::from_slice(&json)?;
        if state.version < STATE_VERSION {
            return Err(Error::configuration(format!(
                "unsupported session state version {} (need >= {STATE_VERSION})",
                state.version
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("wraith-state-test-{name}-{}", std::process::id()));
        path
    }

    #[test]
    fn save_load_round_trip() {
        let mut state = SessionState::new("chrome-143-linux");
        state.cookies.push(Cookie::new("sid", "abc", "x.test"));
        state.tickets.push((
            "x.test:443|chrome-143-linux|h3".to_string(),
            TicketRecord {
                blob: vec![1, 2, 3],
                expires_at: Utc::now() + Duration::hours(1),
                max_early_data: 16384,
                ech_config: None,
            },
        ));
        state.forced_protocol = HttpVersion::H2;

        let path = temp_path("round-trip");
        state.save(&path).unwrap();
        let loaded = SessionState::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.preset, "chrome-143-linux");
        assert_eq!(loaded.forced_protocol, HttpVersion::H2);
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.tickets.len(), 1);
        assert_eq!(loaded.tickets[0].1.max_early_data, 16384);
    }

    #[test]
    fn older_versions_rejected() {
        let mut state = SessionState::new("chrome-143-linux");
        state.version = 3;
        let path = temp_path("old-version");
        state.save(&path).unwrap();
        let err = SessionState::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn newer_versions_load_best_effort() {
        let path = temp_path("new-version");
        let json = format!(
            r#"{{
                "version": {},
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z",
                "preset": "chrome-143-linux",
                "some_future_field": {{"nested": true}}
            }}"#,
            STATE_VERSION + 1
        );
        std::fs::write(&path, json).unwrap();
        let loaded = SessionState::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.version, STATE_VERSION + 1);
        assert!(loaded.cookies.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let state = SessionState::new("safari-18");
        let path = temp_path("perms");
        state.save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        std::fs::remove_file(&path).ok();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn ech_configs_round_trip_base64() {
        let mut configs = HashMap::new();
        configs.insert("x.test".to_string(), vec![0xec, 0x11, 0x22]);
        let mut state = SessionState::new("firefox-133");
        state.ech_configs = SessionState::encode_ech_configs(configs.clone());
        assert_eq!(state.decode_ech_configs(), configs);
    }
}
