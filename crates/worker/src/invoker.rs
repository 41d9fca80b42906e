//! Worker process invocation.
//!
//! Spawns one worker process per attempt with the formatted prompt as its
//! last argument, in a working directory created on demand.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::stream::{Completion, Invocation};
use crate::{tee, InvocationResult, WorkerError};

/// Program name used when nothing more specific is configured.
pub const DEFAULT_PROGRAM: &str = "claude";

/// The command line used to start a worker, minus the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from configuration, resolving the default program to a concrete
    /// binary path when one can be found.
    pub fn from_config(program: &str, args: &[String]) -> Self {
        Self::new(resolve_program(program), args.to_vec())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The exact process invocation for one turn.
    pub fn build(&self, prompt: &str, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Ensure `working_dir` exists, then start the worker.
    pub async fn spawn(
        &self,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<WorkerProcess, WorkerError> {
        tokio::fs::create_dir_all(working_dir)
            .await
            .map_err(|source| WorkerError::CreateDir {
                path: working_dir.to_path_buf(),
                source,
            })?;

        info!(
            component = "worker",
            event = "worker.spawn",
            program = %self.program,
            cwd = %working_dir.display(),
            prompt_len = prompt.len(),
            "Spawning worker"
        );

        let mut child = self
            .build(prompt, working_dir)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::MissingPipe("stderr"))?;

        Ok(WorkerProcess {
            child,
            stdout,
            stderr,
        })
    }
}

/// A freshly spawned worker with both output pipes still attached.
pub struct WorkerProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl WorkerProcess {
    /// Tee stdout and start collecting the result in the background.
    ///
    /// The completion task owns the child, so the process is always reaped
    /// even if every consumer goes away.
    pub fn into_invocation(self) -> Invocation {
        let WorkerProcess {
            mut child,
            stdout,
            stderr,
        } = self;
        let pid = child.id();
        let (live, captured) = tee::split(stdout);

        let task = tokio::spawn(async move {
            let (output, stderr) = tokio::join!(captured.collect_text(), read_stderr(stderr));
            let status = child.wait().await?;
            let exit_code = status.code().unwrap_or(-1);

            debug!(
                component = "worker",
                event = "worker.exit",
                pid = ?pid,
                exit_code,
                output_len = output.len(),
                stderr_len = stderr.len(),
                "Worker exited"
            );

            Ok::<_, WorkerError>(InvocationResult {
                output,
                stderr,
                exit_code,
            })
        });

        Invocation {
            live,
            completion: Completion::pending(task),
        }
    }
}

async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        warn!(
            component = "worker",
            event = "worker.stderr.read_error",
            error = %e,
            "Error reading worker stderr"
        );
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Resolve the worker binary.
///
/// Only the default program name is resolved: `CLAUDE_BIN`, then the
/// well-known local install, then plain `PATH` lookup at spawn time.
/// Any other configured program is used verbatim.
pub fn resolve_program(configured: &str) -> String {
    if configured != DEFAULT_PROGRAM {
        return configured.to_string();
    }

    if let Ok(path) = std::env::var("CLAUDE_BIN") {
        if Path::new(&path).exists() {
            return path;
        }
        warn!(
            component = "worker",
            event = "worker.binary.env_not_found",
            path = %path,
            "CLAUDE_BIN path does not exist, trying fallbacks"
        );
    }

    if let Some(home) = dirs::home_dir() {
        let local = home.join(".claude").join("local").join("claude");
        if local.exists() {
            return local.to_string_lossy().into_owned();
        }
    }

    configured.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
    }

    #[test]
    fn prompt_is_the_last_argument() {
        let cmd = WorkerCommand::new("claude", vec!["--print".into()]);
        let built = cmd.build("say hi", Path::new("/tmp"));
        let args: Vec<_> = built
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["--print", "say hi"]);
        assert_eq!(built.as_std().get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn custom_program_is_not_resolved() {
        assert_eq!(resolve_program("/opt/worker/bin/run"), "/opt/worker/bin/run");
    }

    #[tokio::test]
    async fn creates_missing_working_dir_and_runs_there() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("nested").join("session");

        let process = sh(r#"printf '%s' "$1"; pwd >&2"#)
            .spawn("echo me", &dir)
            .await
            .expect("spawn");
        let invocation = process.into_invocation();
        let (live, result) = tokio::join!(
            invocation.live.collect_text(),
            invocation.completion.wait()
        );
        let result = result.expect("completion");

        assert!(dir.is_dir());
        assert_eq!(live, "echo me");
        assert_eq!(result.output, "echo me");
        assert!(result.stderr.trim_end().ends_with("session"));
        assert!(result.success());
    }

    #[tokio::test]
    async fn existing_working_dir_is_fine() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let process = sh("exit 3")
            .spawn("ignored", tmp.path())
            .await
            .expect("spawn");
        let result = process
            .into_invocation()
            .completion
            .wait()
            .await
            .expect("completion");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = WorkerCommand::new("promptdock-no-such-worker", vec![])
            .spawn("hi", tmp.path())
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn uncreatable_dir_fails_before_spawning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, "x").expect("write file");

        let err = sh("touch spawned")
            .spawn("hi", &file.join("child"))
            .await
            .err()
            .expect("dir creation should fail");
        assert!(matches!(err, WorkerError::CreateDir { .. }));
        assert!(!tmp.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn completion_waits_for_captured_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let process = sh("for i in 1 2 3; do echo line$i; done")
            .spawn("x", tmp.path())
            .await
            .expect("spawn");
        let invocation = process.into_invocation();
        // Nobody reads the live side.
        let result = invocation.completion.wait().await.expect("completion");
        assert_eq!(result.output, "line1\nline2\nline3\n");
    }
}
