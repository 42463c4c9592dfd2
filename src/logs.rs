//! Log sink shared by the daemon's subscriber, its redirected standard streams,
//! and the startup diagnostics written before any subscriber exists.
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{SecondsFormat, Utc};
use tracing::{Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    EnvFilter,
    fmt::{MakeWriter, format::Writer, time::FormatTime},
};

/// Append-only log file. Every write goes straight to the descriptor, so the sink
/// is effectively unbuffered. Cloning yields another handle to the same file.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    /// Opens (creating if needed) the log file at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor of the open file, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.lock().as_ref().map(|file| file.as_raw_fd())
    }

    /// Whether the sink still accepts writes.
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Writes one line prefixed with the current UTC time, as the startup
    /// sequence does before the subscriber is installed.
    pub fn stamp(&self, message: impl fmt::Display) -> io::Result<()> {
        let mut handle = self.clone();
        writeln!(handle, "{}: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"), message)
    }

    /// Writes one line verbatim.
    pub fn line(&self, message: impl fmt::Display) -> io::Result<()> {
        let mut handle = self.clone();
        writeln!(handle, "{message}")
    }

    /// Flushes pending data to disk and closes the file. Later writes are
    /// discarded.
    pub fn flush_and_close(&self) -> io::Result<()> {
        match self.lock().take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_all()
            }
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// RFC 3339 UTC timestamps for each log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtcTimestamp;

impl FormatTime for UtcTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(
            w,
            "[{}]",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Builds the subscriber that writes leveled, span-tagged lines to `sink`.
pub fn sink_subscriber(
    sink: LogSink,
    level: LevelFilter,
) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::default().add_directive(level.into()))
        .with_timer(UtcTimestamp)
        .with_ansi(false)
        .with_target(false)
        .with_writer(sink)
        .finish()
}

/// Installs [`sink_subscriber`] as the process-wide default. Returns `false` when
/// a subscriber was already installed.
pub fn install(sink: &LogSink, level: LevelFilter) -> bool {
    tracing::subscriber::set_global_default(sink_subscriber(sink.clone(), level)).is_ok()
}
