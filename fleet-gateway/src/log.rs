use std::io;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fleet_gateway_task::{ShutdownSignal, Task};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_LOG_FILES: usize = 10;

const DEFAULT_LOG_DIRECTIVE: &str = "info";

/// How long rolled files stick around before the deleter task removes them.
const LOG_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

const DELETER_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a> {
    folder: &'a Utf8Path,
    prefix: &'a str,
}

impl<'a> LogPathCfg<'a> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: "gateway",
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_stem().context("invalid log path (file_stem)")?,
            })
        }
    }
}

pub fn init(path: &Utf8Path, log_directive: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let log_cfg = LogPathCfg::from_path(path)?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(log_cfg.prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_cfg.folder)
        .context("couldn't create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = EnvFilter::try_new(log_directive.unwrap_or(DEFAULT_LOG_DIRECTIVE))
        .context("invalid log filtering directive")?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

/// Removes rolled log files once they fall out of the retention window.
pub struct LogDeleterTask {
    pub prefix: Utf8PathBuf,
}

#[async_trait]
impl Task for LogDeleterTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "log deleter";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(DELETER_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = delete_stale_files(&self.prefix).await {
                        warn!(%error, "Failed to prune old log files");
                    }
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

async fn delete_stale_files(prefix: &Utf8Path) -> anyhow::Result<()> {
    let cfg = LogPathCfg::from_path(prefix)?;

    let mut read_dir = tokio::fs::read_dir(cfg.folder).await.context("couldn't read log directory")?;

    let now = SystemTime::now();

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        match entry.file_name().to_str() {
            Some(file_name) if file_name.starts_with(cfg.prefix) && file_name.contains("log") => {
                let stale = entry
                    .metadata()
                    .await
                    .and_then(|metadata| metadata.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age > LOG_RETENTION);

                if stale {
                    debug!(file_name, "Deleting stale log file");
                    if let Err(error) = tokio::fs::remove_file(entry.path()).await {
                        warn!(%error, file_name, "Couldn't delete log file");
                    }
                }
            }
            _ => continue,
        }
    }

    Ok(())
}
