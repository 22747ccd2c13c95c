//! Log file bootstrap for hosts embedding the session manager.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the host. `init_tracing` is the ready-made one: a log file in the
//! data directory with numbered history, flushed after every line.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, for log shippers.
    Json,
}

/// How `init_tracing` names, filters, and retains its log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub format: LogFormat,
    /// File name inside the log directory.
    pub file_name: String,
    /// Previous runs kept as `<file>.1` (newest) up to `<file>.<keep>`.
    /// Zero discards the previous log entirely.
    pub keep: usize,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file_name: "mcp-sessions.log".to_string(),
            keep: 3,
            default_filter: "mcp_sessions=info,warn".to_string(),
        }
    }
}

impl LogOptions {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }
}

/// Platform data directory for persisted configs and logs.
///
/// - macOS: `~/Library/Application Support/mcp-sessions/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-sessions\`
/// - Linux: `$XDG_DATA_HOME/mcp-sessions/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-sessions/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-sessions");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-sessions")
}

/// Install a global subscriber writing to `<log_dir>/<options.file_name>`.
///
/// The previous log is moved into history first. Returns the log path.
pub fn init_tracing(log_dir: &Path, options: &LogOptions) -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(&options.file_name);
    let retained = rotate_log_file(&log_path, options.keep)?;

    let writer = FlushingWriter::open(&log_path)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = match options.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        retained,
        pid = std::process::id(),
        "mcp-sessions logging started"
    );
    Ok(log_path)
}

fn rotated_path(base: &Path, generation: usize) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift `<base>` into `<base>.1`, `.1` into `.2`, and so on up to `keep`.
///
/// Whatever would land past `keep` is deleted. Returns how many of the
/// `keep` history slots are filled afterwards.
fn rotate_log_file(base: &Path, keep: usize) -> io::Result<usize> {
    if keep == 0 {
        return match std::fs::remove_file(base) {
            Ok(()) => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        };
    }

    let oldest = rotated_path(base, keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for generation in (1..keep).rev() {
        let from = rotated_path(base, generation);
        if from.exists() {
            std::fs::rename(&from, rotated_path(base, generation + 1))?;
        }
    }
    if base.exists() {
        std::fs::rename(base, rotated_path(base, 1))?;
    }

    Ok((1..=keep).filter(|&g| rotated_path(base, g).exists()).count())
}

/// Appending file writer that flushes every write, so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
