//! Executes one chat turn against the worker.
//!
//! Events are tagged with the session generation that requested the turn; the
//! connection loop decides whether they are still routed.

use promptdock_protocol::ServerMessage;
use promptdock_worker::{retry, InvocationResult, RetryPolicy, Utf8Decoder, WorkerCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chat_session::{TurnOutcome, TurnRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEventKind {
    Message(ServerMessage),
    Finished(TurnOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEvent {
    pub generation: u64,
    pub kind: TurnEventKind,
}

pub fn failure_message(result: &InvocationResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("Worker exited with code {}", result.exit_code)
    } else {
        format!("Worker exited with code {}: {stderr}", result.exit_code)
    }
}

/// Run the turn in the background. The task outlives the connection: if the
/// receiver is gone the worker still runs to completion and its events are
/// dropped.
pub fn spawn_turn(
    request: TurnRequest,
    worker: WorkerCommand,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<TurnEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let generation = request.generation;
        let emit = |kind: TurnEventKind| {
            let _ = events.send(TurnEvent { generation, kind });
        };

        let outcome = drive_turn(&request, &worker, &policy, |msg| {
            emit(TurnEventKind::Message(msg))
        })
        .await;

        if events.is_closed() {
            info!(
                component = "chat_turn",
                event = "chat.turn.orphaned",
                generation,
                working_dir = %request.working_dir.display(),
                "Chat turn finished after its connection closed"
            );
        }
        emit(TurnEventKind::Finished(outcome));
    })
}

async fn drive_turn(
    request: &TurnRequest,
    worker: &WorkerCommand,
    policy: &RetryPolicy,
    mut emit: impl FnMut(ServerMessage),
) -> TurnOutcome {
    let invocation = match retry::run(
        worker,
        &request.prompt,
        &request.history,
        &request.working_dir,
        policy,
    )
    .await
    {
        Ok(invocation) => invocation,
        Err(e) => {
            warn!(
                component = "chat_turn",
                event = "chat.turn.start_failed",
                generation = request.generation,
                error = %e,
                "Failed to start worker"
            );
            return TurnOutcome::Failed {
                message: e.to_string(),
            };
        }
    };

    let mut live = invocation.live;
    let mut decoder = Utf8Decoder::new();
    emit(ServerMessage::StreamStart);
    while let Some(chunk) = live.next_chunk().await {
        let text = decoder.push(&chunk);
        if !text.is_empty() {
            emit(ServerMessage::Stream(text));
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        emit(ServerMessage::Stream(tail));
    }
    emit(ServerMessage::StreamEnd);

    match invocation.completion.wait().await {
        Ok(result) if result.success() => TurnOutcome::Succeeded {
            reply: result.output,
        },
        Ok(result) => {
            warn!(
                component = "chat_turn",
                event = "chat.turn.failed",
                generation = request.generation,
                exit_code = result.exit_code,
                "Worker turn failed"
            );
            TurnOutcome::Failed {
                message: failure_message(&result),
            }
        }
        Err(e) => TurnOutcome::Failed {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptdock_protocol::Turn;
    use std::time::Duration;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_unit: Duration::from_millis(1),
        }
    }

    async fn run_to_end(
        request: TurnRequest,
        worker: WorkerCommand,
        policy: RetryPolicy,
    ) -> Vec<TurnEventKind> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_turn(request, worker, policy, tx)
            .await
            .expect("turn task");
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.generation, 7);
            events.push(event.kind);
        }
        events
    }

    fn request(dir: &std::path::Path, prompt: &str, history: Vec<Turn>) -> TurnRequest {
        TurnRequest {
            generation: 7,
            prompt: prompt.into(),
            history,
            working_dir: dir.join("chat-1"),
        }
    }

    fn streamed_text(events: &[TurnEventKind]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEventKind::Message(ServerMessage::Stream(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streams_between_start_and_end_then_succeeds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let events = run_to_end(
            request(tmp.path(), "Hello", Vec::new()),
            sh(r#"printf 'echo: %s' "$1""#),
            fast_policy(1),
        )
        .await;

        assert_eq!(
            events.first(),
            Some(&TurnEventKind::Message(ServerMessage::StreamStart))
        );
        assert_eq!(streamed_text(&events), "echo: Hello");
        let n = events.len();
        assert_eq!(
            events[n - 2],
            TurnEventKind::Message(ServerMessage::StreamEnd)
        );
        assert_eq!(
            events[n - 1],
            TurnEventKind::Finished(TurnOutcome::Succeeded {
                reply: "echo: Hello".into()
            })
        );
    }

    #[tokio::test]
    async fn transient_failure_is_hidden_from_the_stream() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = "n=$(cat attempts 2>/dev/null || echo 0); n=$((n+1)); echo $n > attempts; \
                      if [ $n -eq 1 ]; then echo partial; echo 'API Error: 529' >&2; exit 1; fi; \
                      printf ok";
        let events = run_to_end(
            request(tmp.path(), "Hi", vec![Turn::user("a"), Turn::assistant("b")]),
            sh(script),
            fast_policy(2),
        )
        .await;

        assert_eq!(streamed_text(&events), "ok");
        assert!(matches!(
            events.last(),
            Some(TurnEventKind::Finished(TurnOutcome::Succeeded { reply })) if reply == "ok"
        ));
    }

    #[tokio::test]
    async fn fatal_exit_reports_code_and_stderr() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let events = run_to_end(
            request(tmp.path(), "Hi", Vec::new()),
            sh("echo 'bad flag' >&2; exit 2"),
            fast_policy(3),
        )
        .await;

        assert!(events.contains(&TurnEventKind::Message(ServerMessage::StreamEnd)));
        assert_eq!(
            events.last(),
            Some(&TurnEventKind::Finished(TurnOutcome::Failed {
                message: "Worker exited with code 2: bad flag".into()
            }))
        );
    }

    #[tokio::test]
    async fn spawn_failure_skips_the_stream() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let events = run_to_end(
            request(tmp.path(), "Hi", Vec::new()),
            WorkerCommand::new("/nonexistent/promptdock-worker", Vec::new()),
            fast_policy(3),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TurnEventKind::Finished(TurnOutcome::Failed { message }) if message.contains("spawn")
        ));
    }

    #[test]
    fn failure_message_omits_empty_stderr() {
        let result = InvocationResult {
            output: String::new(),
            stderr: "  \n".into(),
            exit_code: 3,
        };
        assert_eq!(failure_message(&result), "Worker exited with code 3");
    }
}
