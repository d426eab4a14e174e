//! Tracing/logging initialization.
//!
//! The CLI logs JSON lines to a file and, with `--debug`, human-readable lines
//! to stderr. Both sinks go through [`RedactingMakeWriter`] so registered
//! secrets and credential-shaped values never reach disk or the terminal.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::secrets::SecretRegistry;

/// Mode of a freshly created log file.
const LOG_FILE_MODE: u32 = 0o640;

/// Logging options resolved from config and command-line flags.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset (e.g. `"debug"`).
    pub filter: String,
    /// JSON log file. `None` disables file logging.
    pub log_file: Option<PathBuf>,
    /// Mirror log lines to stderr.
    pub stderr: bool,
}

/// Wraps a [`MakeWriter`] so every write is scrubbed before it is emitted.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    secrets: Arc<SecretRegistry>,
}

impl<M> RedactingMakeWriter<M> {
    pub const fn new(inner: M, secrets: Arc<SecretRegistry>) -> Self {
        Self { inner, secrets }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<'a, M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            secrets: &self.secrets,
        }
    }
}

/// Writer produced by [`RedactingMakeWriter`].
///
/// The fmt layer hands over one fully formatted event per `write` call, so
/// scrubbing each buffer independently covers every line.
#[derive(Debug)]
pub struct RedactingWriter<'a, W> {
    inner: W,
    secrets: &'a SecretRegistry,
}

impl<'a, W> RedactingWriter<'a, W> {
    pub const fn new(inner: W, secrets: &'a SecretRegistry) -> Self {
        Self { inner, secrets }
    }
}

impl<W: Write> Write for RedactingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(self.secrets.scrub(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Per-user log file used when not running as root.
///
/// `$XDG_CACHE_HOME/elxr-pro/elxr-pro.log`
pub fn user_log_file() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("elxr-pro").join("elxr-pro.log"))
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(LOG_FILE_MODE)
        .open(path)
}

/// Initialise the global tracing subscriber.
///
/// An unwritable log file is not fatal: the error is returned so the caller
/// can report it, and stderr logging (if requested) still works.
pub fn init_logging(settings: &LogSettings, secrets: &Arc<SecretRegistry>) -> io::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| settings.filter.clone()),
    );

    let (file, file_err) = match settings.log_file.as_deref().map(open_log_file) {
        Some(Ok(f)) => (Some(f), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let file_layer = file.map(|f| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(RedactingMakeWriter::new(Mutex::new(f), Arc::clone(secrets)))
    });
    let stderr_layer = settings.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(RedactingMakeWriter::new(io::stderr, Arc::clone(secrets)))
    });

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();

    file_err.map_or(Ok(()), Err)
}
