//! Structured logging.

use crate::config::LoggingConfig;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter. Falls back to `RUST_LOG`.
pub const LOG_FILTER_ENV: &str = "NOTEGRAPH_LOG";

/// Builds the event filter: `NOTEGRAPH_LOG`, then `RUST_LOG`, then the
/// configured level. `verbose` raises the default to debug.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the configured level is not a valid
/// filter directive.
pub fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    let from_env = std::env::var(LOG_FILTER_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|v| !v.trim().is_empty());
    let directive = match from_env {
        Some(value) => value,
        None if verbose => "notegraph=debug".to_string(),
        None => config.level.clone(),
    };
    EnvFilter::try_new(&directive)
        .map_err(|e| Error::InvalidInput(format!("invalid log filter '{directive}': {e}")))
}

/// Thread-safe file writer for logging.
#[derive(Clone)]
pub(crate) struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Opens a log file for appending, creating parent directories.
pub(crate) fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_log_dir", e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::operation("open_log_file", format!("{}: {e}", path.display())))?;

    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}
