//! Retry controller.
//!
//! Every attempt except the last is *buffered*: it runs to completion and is
//! classified before a single byte reaches the caller, so a transient
//! failure's partial output is never shown. The last attempt is
//! *passthrough*: its live stream is handed to the caller as-is and it is
//! never retried.

use std::path::Path;
use std::time::Duration;

use promptdock_protocol::Turn;
use tracing::{info, warn};

use crate::invoker::WorkerCommand;
use crate::prompt::format_prompt;
use crate::stream::Invocation;
use crate::{InvocationResult, WorkerError};

/// Markers in stderr/stdout that identify an upstream hiccup worth retrying.
/// Matched case-insensitively.
pub const TRANSIENT_SIGNATURES: &[&str] = &["internal server error", "overloaded"];

/// HTTP status codes worth retrying. Only matched as standalone numbers, so
/// `1500` or `5290` in an answer does not count.
pub const TRANSIENT_STATUS_CODES: &[&str] = &["500", "529"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `backoff_unit * 2^n`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    Success,
    Fatal,
    Retryable,
}

pub fn classify(result: &InvocationResult) -> AttemptClass {
    if result.success() {
        return AttemptClass::Success;
    }
    let combined = format!("{}\n{}", result.stderr, result.output).to_lowercase();
    if TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| combined.contains(signature))
        || TRANSIENT_STATUS_CODES
            .iter()
            .any(|code| contains_number(&combined, code))
    {
        AttemptClass::Retryable
    } else {
        AttemptClass::Fatal
    }
}

fn contains_number(haystack: &str, number: &str) -> bool {
    haystack.match_indices(number).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + number.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

/// Run one prompt against the worker with retries.
///
/// Returns the accepted invocation. Errors are only returned for failures
/// that prevent a worker from running at all (directory or spawn failures).
pub async fn run(
    worker: &WorkerCommand,
    prompt: &str,
    history: &[Turn],
    working_dir: &Path,
    policy: &RetryPolicy,
) -> Result<Invocation, WorkerError> {
    let formatted = format_prompt(prompt, history);
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..attempts {
        let (captured, result) = buffered_attempt(worker, &formatted, working_dir).await?;

        match classify(&result) {
            AttemptClass::Success => {
                return Ok(Invocation::replay(captured, result));
            }
            AttemptClass::Fatal => {
                warn!(
                    component = "worker_retry",
                    event = "worker.retry.fatal",
                    attempt,
                    exit_code = result.exit_code,
                    "Worker failed with a non-retryable error"
                );
                return Ok(Invocation::replay(captured, result));
            }
            AttemptClass::Retryable => {
                let delay = policy.backoff(attempt);
                warn!(
                    component = "worker_retry",
                    event = "worker.retry.backoff",
                    attempt,
                    max_attempts = attempts,
                    exit_code = result.exit_code,
                    delay_ms = delay.as_millis() as u64,
                    "Transient worker failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    if attempts > 1 {
        info!(
            component = "worker_retry",
            event = "worker.retry.final_attempt",
            attempt = attempts,
            "Running final attempt unbuffered"
        );
    }
    passthrough_attempt(worker, &formatted, working_dir).await
}

/// Run an attempt to completion, holding its stdout back from the caller.
async fn buffered_attempt(
    worker: &WorkerCommand,
    formatted: &str,
    working_dir: &Path,
) -> Result<(Vec<u8>, InvocationResult), WorkerError> {
    let invocation = worker.spawn(formatted, working_dir).await?.into_invocation();
    let (captured, result) = tokio::join!(
        invocation.live.collect_bytes(),
        invocation.completion.wait()
    );
    Ok((captured, result?))
}

/// Start an attempt whose live stream goes straight to the caller.
async fn passthrough_attempt(
    worker: &WorkerCommand,
    formatted: &str,
    working_dir: &Path,
) -> Result<Invocation, WorkerError> {
    Ok(worker.spawn(formatted, working_dir).await?.into_invocation())
}
