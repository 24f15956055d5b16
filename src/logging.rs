use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEPLOY_LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";
const DIAGNOSTICS_FILE_PREFIX: &str = "deploy_webhook";

/// Append-only record of every pipeline step and outcome.
///
/// Each line goes to stdout and is appended to `path`. The writes happen
/// on tokio's blocking pool and are awaited, so lines keep their order
/// without stalling a runtime worker. Write failures are discarded: a
/// broken log file must never fail a deployment.
#[derive(Debug, Clone)]
pub struct DeployLog {
    path: PathBuf,
}

impl DeployLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log(&self, message: impl AsRef<str>) {
        let line = format_line(Utc::now(), message.as_ref());
        let path = self.path.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || write_line(&path, &line)).await {
            debug!("Deploy log write did not complete: {}", e);
        }
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.log(format!("WARNING: {}", message.as_ref())).await;
    }
}

fn write_line(path: &Path, line: &str) {
    let _ = writeln!(io::stdout().lock(), "{}", line);
    let _ = append(path, line);
}

fn append(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

fn format_line(at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] {}", at.format(DEPLOY_LOG_TIME_FORMAT), message)
}

/// Optional rolling file for tracing diagnostics, separate from the deploy log.
pub struct DiagnosticsFile {
    log_directory: PathBuf,
    rotation: Rotation,
}

impl DiagnosticsFile {
    pub fn new(log_directory: PathBuf) -> Self {
        Self {
            log_directory,
            rotation: Rotation::DAILY,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn writer(&self) -> io::Result<(NonBlocking, WorkerGuard)> {
        std::fs::create_dir_all(&self.log_directory)?;
        let file_appender = RollingFileAppender::new(
            self.rotation.clone(),
            &self.log_directory,
            DIAGNOSTICS_FILE_PREFIX,
        );
        Ok(tracing_appender::non_blocking(file_appender))
    }
}

/// Install the global tracing subscriber: console output filtered by
/// `RUST_LOG` (default `info`), plus the diagnostics file when given.
///
/// The returned guard must be held for the life of the process.
pub fn setup_logging(diagnostics: Option<DiagnosticsFile>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match diagnostics.map(|d| d.writer()) {
        Some(Ok((writer, guard))) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            ),
            Some(guard),
        ),
        Some(Err(e)) => {
            eprintln!("Diagnostics log disabled: {}", e);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}
