//! Stream and completion handles returned to callers of an invocation.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{InvocationResult, WorkerError};

/// An ordered sequence of stdout chunks from a single worker process.
///
/// Ends when the producer side is dropped (the worker closed stdout, or the
/// replayed capture has been fully delivered).
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }

    /// A stream that yields previously captured output once, then ends.
    pub fn replay(captured: Vec<u8>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if !captured.is_empty() {
            let _ = tx.send(Bytes::from(captured));
        }
        Self { rx }
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Drain the stream to the end and return every byte it carried.
    pub async fn collect_bytes(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Drain the stream and decode it as UTF-8, replacing invalid sequences.
    pub async fn collect_text(self) -> String {
        let bytes = self.collect_bytes().await;
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Stream for ChunkStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum CompletionState {
    Pending(JoinHandle<Result<InvocationResult, WorkerError>>),
    Ready(Result<InvocationResult, WorkerError>),
}

/// Resolves to the worker's [`InvocationResult`] once the process has exited
/// and its captured stdout has been fully drained.
pub struct Completion {
    state: CompletionState,
}

impl Completion {
    pub(crate) fn pending(task: JoinHandle<Result<InvocationResult, WorkerError>>) -> Self {
        Self {
            state: CompletionState::Pending(task),
        }
    }

    pub fn ready(result: InvocationResult) -> Self {
        Self {
            state: CompletionState::Ready(Ok(result)),
        }
    }

    pub async fn wait(self) -> Result<InvocationResult, WorkerError> {
        match self.state {
            CompletionState::Ready(result) => result,
            CompletionState::Pending(task) => task
                .await
                .map_err(|e| WorkerError::Join(e.to_string()))?,
        }
    }
}

/// Live output plus eventual result of one accepted worker invocation.
pub struct Invocation {
    pub live: ChunkStream,
    pub completion: Completion,
}

impl Invocation {
    /// Replay an attempt that was already captured and classified.
    pub fn replay(captured: Vec<u8>, result: InvocationResult) -> Self {
        Self {
            live: ChunkStream::replay(captured),
            completion: Completion::ready(result),
        }
    }
}

/// Incremental UTF-8 decoder for chunked output.
///
/// Pipe reads can split a multi-byte character across chunks; the incomplete
/// tail is held back until the next chunk arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_holds_back_split_multibyte_char() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::new();

        // 'é' is two bytes; cut between them.
        let first = decoder.push(&bytes[..2]);
        let second = decoder.push(&bytes[2..]);

        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_truncated_tail_lossily() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn replay_yields_capture_then_ends() {
        let mut stream = ChunkStream::replay(b"captured".to_vec());
        assert_eq!(stream.next_chunk().await.as_deref(), Some(&b"captured"[..]));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn replay_of_empty_capture_ends_immediately() {
        let mut stream = ChunkStream::replay(Vec::new());
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn ready_completion_returns_result() {
        let result = InvocationResult {
            output: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let resolved = Completion::ready(result.clone())
            .wait()
            .await
            .expect("ready completion");
        assert_eq!(resolved, result);
    }
}
