use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILE: &str = "webhook-deploy.log";
const DEFAULT_FILTER: &str = "info";
/// How far back from the end of the log the status page looks
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

/// Append-only audit log on disk. Every event, verification result and
/// deployment outcome ends up here as well as on the console.
pub struct FileLogger {
    log_directory: PathBuf,
    file_name: String,
}

impl FileLogger {
    pub fn new(log_directory: PathBuf) -> Self {
        Self {
            log_directory,
            file_name: DEFAULT_LOG_FILE.to_string(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_directory.join(&self.file_name)
    }

    /// Opens the log file for appending behind a non-blocking writer.
    /// The returned guard must live as long as logging is needed; dropping
    /// it flushes what is still buffered.
    pub fn setup_file_logging(&self) -> io::Result<(NonBlocking, WorkerGuard)> {
        fs::create_dir_all(&self.log_directory)?;

        // Rotation::NEVER appends to exactly `file_name`
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(&self.file_name)
            .build(&self.log_directory)
            .map_err(io::Error::other)?;
        Ok(tracing_appender::non_blocking(file_appender))
    }
}

/// Installs the global subscriber: console output plus the audit file.
/// `RUST_LOG` overrides the default `info` filter.
pub fn setup_logging(file_logger: &FileLogger) -> io::Result<WorkerGuard> {
    let (file_writer, guard) = file_logger.setup_file_logging()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer()) // Console output
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

/// Returns up to `max_lines` trailing lines of the log file, oldest first.
/// Only the last 64 KiB are read, so fewer lines come back when they are long.
pub fn read_recent_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    read_tail_lines(path, max_lines, TAIL_WINDOW_BYTES)
}

fn read_tail_lines(path: &Path, max_lines: usize, window: u64) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::new();
    file.take(window).read_to_end(&mut buf)?;
    let content = String::from_utf8_lossy(&buf);

    // The window may begin mid-line
    let content = if start > 0 {
        content.split_once('\n').map_or("", |(_, rest)| rest)
    } else {
        &*content
    };

    let mut lines: Vec<String> = content
        .lines()
        .rev()
        .take(max_lines)
        .map(str::to_owned)
        .collect();
    lines.reverse();
    Ok(lines)
}

/// Routes this thread's tracing output into a temporary audit file, the same
/// way the service writes its log, so tests can assert on what was recorded.
#[cfg(test)]
pub(crate) struct AuditCapture {
    dir: tempfile::TempDir,
    worker_guard: WorkerGuard,
    default_guard: tracing::subscriber::DefaultGuard,
}

#[cfg(test)]
impl AuditCapture {
    const FILE_NAME: &'static str = "audit.log";

    pub(crate) fn start() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let logger = FileLogger::new(dir.path().to_path_buf()).with_file_name(Self::FILE_NAME);
        let (writer, worker_guard) = logger.setup_file_logging().expect("audit log opens");

        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();
        let default_guard = tracing::subscriber::set_default(subscriber);

        Self {
            dir,
            worker_guard,
            default_guard,
        }
    }

    /// Uninstalls the subscriber, flushes the writer and returns the log text
    pub(crate) fn finish(self) -> String {
        let Self {
            dir,
            worker_guard,
            default_guard,
        } = self;
        drop(default_guard);
        drop(worker_guard);
        fs::read_to_string(dir.path().join(Self::FILE_NAME)).expect("audit log readable")
    }
}
