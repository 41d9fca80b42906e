use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "app.log";

/// Hands out the current non-blocking file writer. Swapped on reopen.
#[derive(Clone)]
struct SwappableWriter {
    current: Arc<ArcSwap<NonBlocking>>,
}

impl<'a> MakeWriter<'a> for SwappableWriter {
    type Writer = NonBlocking;

    fn make_writer(&'a self) -> Self::Writer {
        self.current.load().as_ref().clone()
    }
}

pub struct LoggingHandle {
    writer: Arc<ArcSwap<NonBlocking>>,
    guard: Mutex<Option<WorkerGuard>>,
    log_dir: Mutex<PathBuf>,
}

impl LoggingHandle {
    /// Point the log at a new directory. Lines already queued for the old
    /// file are flushed when its guard drops.
    pub fn reopen(&self, log_dir: &Path) -> anyhow::Result<()> {
        let mut current_dir = self
            .log_dir
            .lock()
            .map_err(|_| anyhow::anyhow!("log dir lock poisoned"))?;
        if current_dir.as_path() == log_dir {
            return Ok(());
        }

        let (writer, guard) = open_writer(log_dir)?;
        self.writer.store(Arc::new(writer));
        let old_guard = self
            .guard
            .lock()
            .map_err(|_| anyhow::anyhow!("log guard lock poisoned"))?
            .replace(guard);
        drop(old_guard);
        *current_dir = log_dir.to_path_buf();

        tracing::info!(
            component = "logging",
            event = "logging.reopened",
            log_path = %log_dir.join(LOG_FILE).display(),
        );
        Ok(())
    }
}

fn open_writer(log_dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    Ok(tracing_appender::non_blocking(file_appender))
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    let log_path = log_dir.join(LOG_FILE);

    if std::env::var("PROMPTDOCK_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        std::fs::create_dir_all(log_dir)?;
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let filter = std::env::var("PROMPTDOCK_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let (writer, guard) = open_writer(log_dir)?;
    let current = Arc::new(ArcSwap::from_pointee(writer));
    let make_writer = SwappableWriter {
        current: current.clone(),
    };
    let format = std::env::var("PROMPTDOCK_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(make_writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(make_writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = %format,
        filter = %std::env::var("PROMPTDOCK_LOG_FILTER")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
    );

    Ok(LoggingHandle {
        writer: current,
        guard: Mutex::new(Some(guard)),
        log_dir: Mutex::new(log_dir.to_path_buf()),
    })
}
