pub mod gateway;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/ollama-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\ollama-gateway\`
/// - Linux: `$XDG_DATA_HOME/ollama-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.ollama-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("ollama-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ollama-gateway")
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`
/// (default: [`data_dir`]).
///
/// On each startup:
/// 1. Rotates existing logs (gateway.log → gateway.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh gateway.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log file path for discoverability.
///
/// Returns the log file path.
pub fn init_tracing(log_dir: Option<&Path>) -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("gateway.log");
    rotate_log_file(&log_path, 3);

    let log_file = File::options()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ollama_gateway=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(LineFlushedFile::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== ollama-gateway starting ==="
    );
    Ok(log_path)
}

/// Numbered sibling of the live log: `gateway.log` → `gateway.log.{n}`.
fn rotated_path(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `gateway.log.{n}` to `.{n+1}` for every generation below `keep`,
/// then move the live log to `.1`. Generation `keep` falls off the end.
fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        return;
    }
    let _ = std::fs::remove_file(rotated_path(base, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(rotated_path(base, n), rotated_path(base, n + 1));
    }
    let _ = std::fs::rename(base, rotated_path(base, 1));
}

/// Log sink that hands each event a locked file handle and flushes it when
/// the event is done, so a killed session still leaves complete lines.
struct LineFlushedFile(Arc<Mutex<File>>);

impl LineFlushedFile {
    fn new(file: File) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }
}

/// Exclusive access to the log file for one event.
struct FlushOnDrop<'a>(MutexGuard<'a, File>);

impl Write for FlushOnDrop<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Drop for FlushOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.flush();
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LineFlushedFile {
    type Writer = FlushOnDrop<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        // A panic while logging must not silence every later event.
        FlushOnDrop(self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gateway.log");
        for (name, body) in [
            ("gateway.log", "current"),
            ("gateway.log.1", "one"),
            ("gateway.log.2", "two"),
            ("gateway.log.3", "three"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |n: &str| std::fs::read_to_string(dir.path().join(n)).unwrap();
        assert_eq!(read("gateway.log.1"), "current");
        assert_eq!(read("gateway.log.2"), "one");
        assert_eq!(read("gateway.log.3"), "two");
    }

    #[test]
    fn test_rotate_log_file_missing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gateway.log");
        rotate_log_file(&base, 3);
        assert!(!base.exists());
    }

    #[test]
    fn test_each_event_reaches_disk() {
        use tracing_subscriber::fmt::MakeWriter;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let sink = LineFlushedFile::new(File::create(&path).unwrap());

        sink.make_writer().write_all(b"selected LAN\n").unwrap();
        sink.make_writer().write_all(b"retry\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "selected LAN\nretry\n");
    }

    #[test]
    fn test_rotated_path_appends_generation() {
        let base = Path::new("/var/log/gateway.log");
        assert_eq!(rotated_path(base, 2), PathBuf::from("/var/log/gateway.log.2"));
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy();
        assert!(name.contains("ollama-gateway"));
    }
}
