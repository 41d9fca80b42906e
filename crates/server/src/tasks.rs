//! Named task runs: scheduled, API-triggered or one-shot from the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use promptdock_protocol::{OutputStream, RunStatus, RunSummary};
use promptdock_worker::{retry, Utf8Decoder};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{NotifyOn, TaskConfig};
use crate::notifications::Notification;
use crate::state::AppState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task is disabled: {0}")]
    Disabled(String),
}

/// Appends `[timestamp] [LEVEL] [task] message` lines to `<logDir>/<task>.log`.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
    task: String,
}

impl TaskLog {
    pub fn new(log_dir: &Path, task: &str) -> Self {
        Self {
            path: log_dir.join(format!("{task}.log")),
            task: task.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn info(&self, message: &str) {
        self.write("INFO", message).await;
    }

    pub async fn error(&self, message: &str) {
        self.write("ERROR", message).await;
    }

    fn line(&self, level: &str, message: &str) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        format!("[{timestamp}] [{level}] [{}] {message}\n", self.task)
    }

    /// Write failures are reported through tracing and otherwise ignored.
    async fn write(&self, level: &str, message: &str) {
        let line = self.line(level, message);
        let result = async {
            if let Some(dir) = self.path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            // tokio's File hands writes to a blocking task; flush waits for it.
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(
                component = "tasks",
                event = "tasks.log_write_failed",
                path = %self.path.display(),
                error = %e,
                "Failed to write task log"
            );
        }
    }
}

/// Start a background run of `name`. Returns the new run's summary right
/// away and a handle resolving to the final summary.
pub fn run_task(
    state: &Arc<AppState>,
    name: &str,
) -> Result<(RunSummary, JoinHandle<Option<RunSummary>>), TaskError> {
    let config = state.config();
    let task = config
        .task(name)
        .cloned()
        .ok_or_else(|| TaskError::NotFound(name.to_string()))?;
    if !task.enabled {
        return Err(TaskError::Disabled(name.to_string()));
    }

    let log = TaskLog::new(&config.log_dir, &task.name);
    let id = state.runs.begin(&task.name, &task.prompt, &task.working_dir);
    let summary = state
        .runs
        .summary(&id)
        .ok_or_else(|| TaskError::NotFound(name.to_string()))?;
    info!(
        component = "tasks",
        event = "tasks.run_started",
        task = %task.name,
        run_id = %id,
        working_dir = %task.working_dir.display(),
        task_log = %log.path().display(),
        "Task run started"
    );

    let handle = tokio::spawn(drive_run(state.clone(), id, task, log));
    Ok((summary, handle))
}

async fn drive_run(
    state: Arc<AppState>,
    id: String,
    task: TaskConfig,
    log: TaskLog,
) -> Option<RunSummary> {
    log.info(&format!("Starting run {id} in {}", task.working_dir.display()))
        .await;
    let config = state.config();

    let exit_code = match retry::run(
        &config.chat.worker_command(),
        &task.prompt,
        &[],
        &task.working_dir,
        &config.chat.retry_policy(),
    )
    .await
    {
        Ok(invocation) => {
            let mut live = invocation.live;
            let mut decoder = Utf8Decoder::new();
            while let Some(chunk) = live.next_chunk().await {
                state
                    .runs
                    .append_output(&id, OutputStream::Stdout, decoder.push(&chunk));
            }
            state
                .runs
                .append_output(&id, OutputStream::Stdout, decoder.finish());

            match invocation.completion.wait().await {
                Ok(result) => {
                    state
                        .runs
                        .append_output(&id, OutputStream::Stderr, result.stderr);
                    Some(result.exit_code)
                }
                Err(e) => {
                    state
                        .runs
                        .append_output(&id, OutputStream::Stderr, e.to_string());
                    None
                }
            }
        }
        Err(e) => {
            log.error(&format!("Failed to start worker: {e}")).await;
            state
                .runs
                .append_output(&id, OutputStream::Stderr, e.to_string());
            None
        }
    };

    let summary = state.runs.finish(&id, exit_code)?;
    let exit_label = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
    let outcome = if summary.status == RunStatus::Completed {
        log.info(&format!("Run {id} completed")).await;
        info!(
            component = "tasks",
            event = "tasks.run_completed",
            task = %task.name,
            run_id = %id,
            "Task run completed"
        );
        NotifyOn::Success
    } else {
        log.error(&format!("Run {id} failed (exit code {exit_label})"))
            .await;
        error!(
            component = "tasks",
            event = "tasks.run_failed",
            task = %task.name,
            run_id = %id,
            exit_code = %exit_label,
            "Task run failed"
        );
        NotifyOn::Failure
    };

    if task.notifies_on(outcome) {
        let notification = match outcome {
            NotifyOn::Success => Notification {
                title: format!("Task completed: {}", task.name),
                body: format!("Run {id} finished successfully."),
                url: None,
            },
            NotifyOn::Failure => Notification {
                title: format!("Task failed: {}", task.name),
                body: format!("Run {id} failed (exit code {exit_label})."),
                url: None,
            },
        };
        let token = state.config().pushbullet.token.clone();
        if let Err(e) = state.notifier.send(&token, &notification).await {
            warn!(
                component = "tasks",
                event = "tasks.notify_failed",
                task = %task.name,
                run_id = %id,
                error = %e,
                "Failed to send task notification"
            );
        }
    }

    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::{sh_worker_config, task};
    use crate::config::AppConfig;
    use crate::notifications::Notifier;

    fn state_with(config: AppConfig) -> Arc<AppState> {
        Arc::new(AppState::new(config, Notifier::new(reqwest::Client::new())))
    }

    fn config(script: &str, root: &Path) -> AppConfig {
        let mut config = sh_worker_config(script, &root.join("chat"), &root.join("logs"));
        config.tasks.insert(
            "nightly".into(),
            task("nightly", "Summarize", &root.join("work")),
        );
        config
    }

    #[tokio::test]
    async fn unknown_and_disabled_tasks_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config("true", tmp.path());
        if let Some(t) = cfg.tasks.get_mut("nightly") {
            t.enabled = false;
        }
        let state = state_with(cfg);

        assert_eq!(
            run_task(&state, "missing").err(),
            Some(TaskError::NotFound("missing".into()))
        );
        assert_eq!(
            run_task(&state, "nightly").err(),
            Some(TaskError::Disabled("nightly".into()))
        );
        assert!(state.runs.list().is_empty());
    }

    #[tokio::test]
    async fn successful_run_records_output_and_logs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = state_with(config(r#"printf 'did: %s' "$1"; echo warn >&2"#, tmp.path()));

        let (started, handle) = run_task(&state, "nightly").expect("start");
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.task_name, "nightly");

        let finished = handle.await.expect("join").expect("summary");
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.exit_code, Some(0));

        let detail = state.runs.get(&started.id).expect("detail");
        let stdout: String = detail
            .output
            .iter()
            .filter(|c| c.stream == OutputStream::Stdout)
            .map(|c| c.data.as_str())
            .collect();
        assert_eq!(stdout, "did: Summarize");
        assert!(detail
            .output
            .iter()
            .any(|c| c.stream == OutputStream::Stderr && c.data.contains("warn")));
        assert!(tmp.path().join("work").is_dir());

        let log = std::fs::read_to_string(tmp.path().join("logs").join("nightly.log"))
            .expect("task log");
        assert!(log.contains("[INFO] [nightly] Starting run"));
        assert!(log.contains(&format!("Run {} completed", started.id)));
    }

    #[tokio::test]
    async fn failing_run_is_marked_failed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = state_with(config("exit 4", tmp.path()));

        let (_, handle) = run_task(&state, "nightly").expect("start");
        let finished = handle.await.expect("join").expect("summary");

        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.exit_code, Some(4));
        let log = std::fs::read_to_string(tmp.path().join("logs").join("nightly.log"))
            .expect("task log");
        assert!(log.contains("[ERROR] [nightly]"));
        assert!(log.contains("exit code 4"));
    }

    #[tokio::test]
    async fn task_log_lines_are_bracketed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::new(tmp.path(), "backup");
        log.info("first").await;
        log.error("second").await;

        let contents = std::fs::read_to_string(log.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] [INFO] [backup] first"));
        assert!(lines[1].ends_with("] [ERROR] [backup] second"));
    }

    #[tokio::test]
    async fn task_log_line_is_on_disk_when_write_returns() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::new(tmp.path(), "sync");

        for i in 0..50 {
            log.info(&format!("line {i}")).await;
            let contents = std::fs::read_to_string(log.path()).expect("read");
            assert_eq!(contents.lines().count(), i + 1, "after line {i}");
            assert!(contents.ends_with(&format!("[INFO] [sync] line {i}\n")));
        }
    }
}
