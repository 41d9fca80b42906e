//! Watches the config directories and requests a reload once changes settle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEBOUNCE: Duration = Duration::from_secs(1);

pub struct ConfigWatcher {
    // Dropping the watcher closes the event channel and ends `task`.
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `dirs` (non-recursively). Each burst of changes produces one
    /// message on `reload_tx`, `debounce` after the last event.
    pub fn start(
        dirs: &[PathBuf],
        debounce: Duration,
        reload_tx: mpsc::Sender<()>,
    ) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches_supported_event_kind(&event.kind) {
                        return;
                    }
                    for path in event.paths.into_iter().filter(|p| is_config_file(p)) {
                        let _ = tx.send(path);
                    }
                }
                Err(err) => {
                    warn!(
                        component = "config_watcher",
                        event = "config_watcher.fs_event_error",
                        error = %err,
                        "Config watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )?;

        for dir in dirs {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => info!(
                    component = "config_watcher",
                    event = "config_watcher.watching",
                    path = %dir.display(),
                    "Watching config directory"
                ),
                Err(err) => warn!(
                    component = "config_watcher",
                    event = "config_watcher.watch_failed",
                    path = %dir.display(),
                    error = %err,
                    "Failed to watch config directory"
                ),
            }
        }

        let task = tokio::spawn(async move {
            let mut pending: Option<JoinHandle<()>> = None;
            while let Some(path) = rx.recv().await {
                info!(
                    component = "config_watcher",
                    event = "config_watcher.change_detected",
                    path = %path.display(),
                    "Config change detected"
                );
                if let Some(handle) = pending.take() {
                    handle.abort();
                }
                let reload_tx = reload_tx.clone();
                pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let _ = reload_tx.send(()).await;
                }));
            }
            if let Some(handle) = pending {
                handle.abort();
            }
        });

        Ok(Self { watcher, task })
    }

    pub fn stop(self) {
        drop(self.watcher);
        self.task.abort();
        info!(
            component = "config_watcher",
            event = "config_watcher.stopped",
            "Stopped watching config files"
        );
    }
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Whether `path` is one of the files the config loader reads.
pub fn is_config_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
