//! Interval task scheduler.
//!
//! Accepts a deliberately tiny subset of cron syntax: `*/N * * * *` (every N
//! minutes) and `* * * * *` (every minute). This is not a cron
//! implementation; hour/day/month/weekday fields are ignored with a warning.
//! Due tasks are reported by name over a channel; running them is someone
//! else's job.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AppConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule format: expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid minute interval: {0}")]
    InvalidInterval(String),

    #[error("Unsupported schedule `{0}`: only \"*/N * * * *\" and \"* * * * *\" are supported")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub every: Duration,
    /// True when non-minute fields were present and ignored.
    pub ignored_fields: bool,
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, rest @ ..] = fields.as_slice() else {
        return Err(ScheduleError::FieldCount(0));
    };
    if fields.len() != 5 {
        return Err(ScheduleError::FieldCount(fields.len()));
    }
    let rest_wildcard = rest.iter().all(|f| *f == "*");

    if let Some(n) = minute.strip_prefix("*/") {
        let secs = n
            .parse::<u64>()
            .ok()
            .filter(|m| *m > 0)
            .and_then(|m| m.checked_mul(60))
            .ok_or_else(|| ScheduleError::InvalidInterval(n.to_string()))?;
        return Ok(Schedule {
            every: Duration::from_secs(secs),
            ignored_fields: !rest_wildcard,
        });
    }

    if *minute == "*" && rest_wildcard {
        return Ok(Schedule {
            every: Duration::from_secs(60),
            ignored_fields: false,
        });
    }

    Err(ScheduleError::Unsupported(expr.to_string()))
}

pub struct TaskScheduler {
    jobs: HashMap<String, JoinHandle<()>>,
    trigger_tx: mpsc::Sender<String>,
}

impl TaskScheduler {
    pub fn new(trigger_tx: mpsc::Sender<String>) -> Self {
        Self {
            jobs: HashMap::new(),
            trigger_tx,
        }
    }

    /// (Re)schedule `name`. The first trigger fires one interval from now.
    pub fn schedule(&mut self, name: &str, expr: &str) -> Result<Duration, ScheduleError> {
        let schedule = parse_schedule(expr)?;
        if schedule.ignored_fields {
            warn!(
                component = "scheduler",
                event = "scheduler.fields_ignored",
                task = %name,
                schedule = %expr,
                "Only minute intervals are supported; other fields are ignored"
            );
        }
        let every = schedule.every;
        let first = Instant::now()
            .checked_add(every)
            .ok_or_else(|| ScheduleError::InvalidInterval(format!("{}m", every.as_secs() / 60)))?;
        self.stop(name);

        let tx = self.trigger_tx.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                info!(
                    component = "scheduler",
                    event = "scheduler.triggered",
                    task = %task_name,
                    "Scheduled task triggered"
                );
                if tx.send(task_name.clone()).await.is_err() {
                    break;
                }
            }
        });
        self.jobs.insert(name.to_string(), handle);

        info!(
            component = "scheduler",
            event = "scheduler.scheduled",
            task = %name,
            schedule = %expr,
            every_secs = every.as_secs(),
            "Scheduled task"
        );
        Ok(every)
    }

    pub fn stop(&mut self, name: &str) -> bool {
        match self.jobs.remove(name) {
            Some(handle) => {
                handle.abort();
                info!(
                    component = "scheduler",
                    event = "scheduler.unscheduled",
                    task = %name,
                    "Unscheduled task"
                );
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.jobs.drain() {
            handle.abort();
        }
    }

    /// Replace all jobs with the enabled, scheduled tasks from `config`.
    /// Returns how many were scheduled.
    pub fn schedule_tasks(&mut self, config: &AppConfig) -> usize {
        self.stop_all();
        let mut scheduled = 0;
        for (name, task) in &config.tasks {
            let Some(expr) = task.schedule.as_deref().filter(|_| task.enabled) else {
                continue;
            };
            match self.schedule(name, expr) {
                Ok(_) => scheduled += 1,
                Err(e) => error!(
                    component = "scheduler",
                    event = "scheduler.invalid_schedule",
                    task = %name,
                    schedule = %expr,
                    error = %e,
                    "Invalid schedule for task"
                ),
            }
        }
        scheduled
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
