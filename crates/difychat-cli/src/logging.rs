use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log file that keeps one backup: once a write would push it past
/// `limit_bytes` the current file becomes `<name>.1` and a fresh one starts.
#[derive(Debug)]
pub(crate) struct RotatingLogFile {
    path: PathBuf,
    backup: PathBuf,
    limit_bytes: u64,
    file: File,
    written: u64,
}

impl RotatingLogFile {
    pub(crate) fn open(path: &Path, limit_bytes: u64) -> Result<Self, String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|error| format!("create log directory {}: {error}", dir.display()))?;
        }
        let file = append_to(path)
            .map_err(|error| format!("open log file {}: {error}", path.display()))?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        let mut backup = path.as_os_str().to_os_string();
        backup.push(".1");
        Ok(Self {
            path: path.to_path_buf(),
            backup: PathBuf::from(backup),
            limit_bytes,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        match fs::remove_file(&self.backup) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(error),
            _ => {}
        }
        fs::rename(&self.path, &self.backup)?;
        self.file = append_to(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RotatingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // An empty file takes the record even when it alone exceeds the limit.
        if self.written > 0 && self.written.saturating_add(buf.len() as u64) > self.limit_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written = self.written.saturating_add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
/// Failures are reported on stderr and leave logging off.
pub fn init_tracing(config: &LogConfig) {
    if let Err(error) = try_init_tracing(config) {
        eprintln!("warning: difychat logging disabled: {error}");
    }
}

fn try_init_tracing(config: &LogConfig) -> Result<(), String> {
    let log_file = RotatingLogFile::open(&config.file_path, config.rotate_size_bytes)?;
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let stderr_layer = config
        .stderr
        .then(|| fmt::layer().with_ansi(false).with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(stderr_layer)
        .try_init()
        .map_err(|error| error.to_string())?;
    let _ = LOG_GUARD.set(guard);
    Ok(())
}
