//! PromptDock worker orchestration
//!
//! Runs the external text-generation worker (the `claude` CLI by default) for
//! a single prompt: formats the conversation, spawns the process, tees its
//! stdout into a live stream and a captured buffer, and retries transient
//! failures without ever leaking a discarded attempt's output.

pub mod invoker;
pub mod prompt;
pub mod retry;
pub mod stream;
pub mod tee;

use std::path::PathBuf;

pub use invoker::{resolve_program, WorkerCommand, WorkerProcess};
pub use prompt::format_prompt;
pub use retry::{classify, run, AttemptClass, RetryPolicy};
pub use stream::{ChunkStream, Completion, Invocation, Utf8Decoder};
use thiserror::Error;

/// Errors that abort an invocation before the worker produces a result.
/// None of these are retried.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to create working directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker is missing its {0} pipe")]
    MissingPipe(&'static str),

    #[error("Worker communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker completion task failed: {0}")]
    Join(String),
}

/// What one worker process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub output: String,
    pub stderr: String,
    /// Process exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
