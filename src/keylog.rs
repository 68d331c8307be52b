//! TLS key logging in `SSLKEYLOGFILE` format.
//!
//! When the `SSLKEYLOGFILE` environment variable names a path, every TLS
//! and QUIC handshake appends its secrets there so tools like Wireshark
//! can decrypt captured traffic. Files are opened append-only with 0600
//! permissions. A session can also install its own sink via
//! [`crate::session::SessionBuilder::key_log_sink`], which takes
//! precedence over the global writer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

/// A destination for key-log lines. Implementations must be cheap to
/// call from handshake callbacks.
pub trait KeyLogSink: Send + Sync {
    fn log_line(&self, line: &str);
}

/// File-backed sink (append, 0600).
struct FileSink {
    file: Mutex<std::fs::File>,
}

impl KeyLogSink for FileSink {
    fn log_line(&self, line: &str) {
        if let Ok(mut f) = self.file.lock() {
            // Key logging is a debug facility; swallow write errors.
            let _ = writeln!(f, "{}", line);
        }
    }
}

type SharedSink = std::sync::Arc<dyn KeyLogSink>;

/// A mutable per-session sink slot. The TLS and QUIC dialers read it at
/// handshake time, so `set_key_log_sink` on a live session affects the
/// next connection.
pub type KeyLogSlot = std::sync::Arc<Mutex<Option<SharedSink>>>;

/// Read a slot, falling back to the global sink.
pub fn resolve_sink(slot: &KeyLogSlot) -> Option<SharedSink> {
    slot.lock()
        .ok()
        .and_then(|s| s.clone())
        .or_else(key_log_sink)
}

fn global() -> &'static Mutex<Option<SharedSink>> {
    static GLOBAL: OnceLock<Mutex<Option<SharedSink>>> = OnceLock::new();
    GLOBAL.get_or_init(|| Mutex::new(sink_from_env()))
}

fn sink_from_env() -> Option<SharedSink> {
    let path = std::env::var("SSLKEYLOGFILE").ok()?;
    if path.is_empty() {
        return None;
    }
    open_sink(Path::new(&path)).ok()
}

fn open_sink(path: &Path) -> std::io::Result<SharedSink> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let file = opts.open(path)?;
    Ok(std::sync::Arc::new(FileSink {
        file: Mutex::new(file),
    }))
}

/// Get the global key-log sink, if one is configured.
pub fn key_log_sink() -> Option<SharedSink> {
    global().lock().ok().and_then(|g| g.clone())
}

/// Point the global key log at a file, overriding `SSLKEYLOGFILE`.
/// An empty path disables key logging.
pub fn set_key_log_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut guard = global().lock().expect("key log lock poisoned");
    if path.as_os_str().is_empty() {
        *guard = None;
        return Ok(());
    }
    *guard = Some(open_sink(path)?);
    Ok(())
}

/// Install a custom key-log sink (e.g., an in-memory buffer in tests).
/// Pass `None` to disable key logging.
pub fn set_key_log_sink(sink: Option<SharedSink>) {
    let mut guard = global().lock().expect("key log lock poisoned");
    *guard = sink;
}

/// Drop the global writer. Called once at shutdown for clean teardown.
pub fn close_key_log() {
    let mut guard = global().lock().expect("key log lock poisoned");
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CaptureSink(Mutex<Vec<String>>);

    impl KeyLogSink for CaptureSink {
        fn log_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn custom_sink_receives_lines() {
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        let dyn_sink: Arc<dyn KeyLogSink> = sink.clone();
        set_key_log_sink(Some(dyn_sink));

        if let Some(s) = key_log_sink() {
            s.log_line("CLIENT_HANDSHAKE_TRAFFIC_SECRET deadbeef cafe");
        }

        assert_eq!(sink.0.lock().unwrap().len(), 1);
        close_key_log();
        assert!(key_log_sink().is_none());
    }
}
