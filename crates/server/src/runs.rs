//! Registry of background task runs, keyed by run id for status polling.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use promptdock_protocol::{new_id, OutputChunk, OutputStream, RunDetail, RunStatus, RunSummary};

struct RunRecord {
    id: String,
    task_name: String,
    prompt: String,
    working_dir: PathBuf,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: RunStatus,
    output: Vec<OutputChunk>,
    exit_code: Option<i32>,
}

impl RunRecord {
    fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            task_name: self.task_name.clone(),
            working_dir: self.working_dir.display().to_string(),
            status: self.status,
            start_time: stamp(&self.started_at),
            end_time: self.ended_at.as_ref().map(stamp),
            exit_code: self.exit_code,
        }
    }

    fn detail(&self) -> RunDetail {
        RunDetail {
            summary: self.summary(),
            prompt: self.prompt.clone(),
            output: self.output.clone(),
        }
    }
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Finished runs kept for polling. Running runs are never evicted.
pub const MAX_FINISHED_RUNS: usize = 200;

pub struct RunRegistry {
    runs: DashMap<String, RunRecord>,
    max_finished: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_limit(MAX_FINISHED_RUNS)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_finished: usize) -> Self {
        Self {
            runs: DashMap::new(),
            max_finished,
        }
    }

    /// Record a new run in the `running` state and return its id.
    pub fn begin(&self, task_name: &str, prompt: &str, working_dir: &Path) -> String {
        let id = new_id();
        self.runs.insert(
            id.clone(),
            RunRecord {
                id: id.clone(),
                task_name: task_name.to_string(),
                prompt: prompt.to_string(),
                working_dir: working_dir.to_path_buf(),
                started_at: Utc::now(),
                ended_at: None,
                status: RunStatus::Running,
                output: Vec::new(),
                exit_code: None,
            },
        );
        id
    }

    pub fn append_output(&self, id: &str, stream: OutputStream, data: String) {
        if data.is_empty() {
            return;
        }
        if let Some(mut run) = self.runs.get_mut(id) {
            run.output.push(OutputChunk { stream, data });
        }
    }

    /// Mark a run finished. `None` means the worker never produced an exit
    /// code (it could not be started).
    pub fn finish(&self, id: &str, exit_code: Option<i32>) -> Option<RunSummary> {
        let summary = {
            let mut run = self.runs.get_mut(id)?;
            run.ended_at = Some(Utc::now());
            run.exit_code = exit_code;
            run.status = if exit_code == Some(0) {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            run.summary()
        };
        self.evict_finished();
        Some(summary)
    }

    /// Drop the oldest finished runs beyond the limit.
    fn evict_finished(&self) {
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .runs
            .iter()
            .filter_map(|run| run.ended_at.map(|ended| (ended, run.id.clone())))
            .collect();
        if finished.len() <= self.max_finished {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            self.runs.remove(&id);
        }
    }

    pub fn summary(&self, id: &str) -> Option<RunSummary> {
        self.runs.get(id).map(|run| run.summary())
    }

    pub fn get(&self, id: &str) -> Option<RunDetail> {
        self.runs.get(id).map(|run| run.detail())
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Vec<RunSummary> {
        let mut runs: Vec<(DateTime<Utc>, RunSummary)> = self
            .runs
            .iter()
            .map(|run| (run.started_at, run.summary()))
            .collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        runs.into_iter().map(|(_, summary)| summary).collect()
    }
}
