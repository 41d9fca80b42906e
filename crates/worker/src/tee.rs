//! Stdout tee.
//!
//! One reader task pulls from the worker pipe and pushes every chunk into an
//! independent queue per consumer. Queues are unbounded, so an unread or slow
//! consumer never stalls the other one; memory is bounded by the worker's
//! total output. A dropped consumer is skipped and the pipe is still read to
//! EOF so the worker never sees a broken pipe.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::ChunkStream;

const READ_BUF_BYTES: usize = 8 * 1024;

/// Split `reader` into two streams that observe the identical byte sequence.
///
/// Returns `(live, captured)`. Both streams end once the reader hits EOF.
pub fn split<R>(reader: R) -> (ChunkStream, ChunkStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (live_tx, live_rx) = mpsc::unbounded_channel::<Bytes>();
    let (captured_tx, captured_rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(pump(reader, [live_tx, captured_tx]));

    (ChunkStream::new(live_rx), ChunkStream::new(captured_rx))
}

async fn pump<R>(mut reader: R, consumers: [mpsc::UnboundedSender<Bytes>; 2])
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_BYTES];
    let mut total = 0usize;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                for tx in &consumers {
                    // A closed consumer just stops receiving.
                    let _ = tx.send(chunk.clone());
                }
            }
            Err(e) => {
                warn!(
                    component = "worker_tee",
                    event = "worker.stdout.read_error",
                    error = %e,
                    "Error reading worker stdout"
                );
                break;
            }
        }
    }

    debug!(
        component = "worker_tee",
        event = "worker.stdout.eof",
        bytes = total,
        "Worker stdout closed"
    );
    // Dropping the senders ends both consumer streams.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn both_consumers_see_identical_bytes() {
        let (live, captured) = split(&b"first line\nsecond line\n"[..]);

        let (live_bytes, captured_bytes) =
            tokio::join!(live.collect_bytes(), captured.collect_bytes());

        assert_eq!(live_bytes, b"first line\nsecond line\n");
        assert_eq!(live_bytes, captured_bytes);
    }

    #[tokio::test]
    async fn unread_consumer_does_not_block_the_other() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (mut live, captured) = split(reader);

        // Far more than the duplex buffer; would deadlock if the pump waited
        // on the captured side.
        let payload = vec![b'x'; 256 * 1024];
        let expected = payload.len();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&payload).await.expect("write payload");
        });

        let mut seen = 0;
        while seen < expected {
            let chunk = live.next_chunk().await.expect("live chunk");
            seen += chunk.len();
        }
        writer_task.await.expect("writer task");

        // Captured side still holds everything once drained.
        assert_eq!(captured.collect_bytes().await.len(), expected);
        assert!(live.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn dropped_consumer_is_skipped() {
        let (live, captured) = split(&b"still delivered"[..]);
        drop(live);
        assert_eq!(captured.collect_text().await, "still delivered");
    }

    #[tokio::test]
    async fn chunks_arrive_in_write_order() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (mut live, captured) = split(reader);

        for part in ["a", "b", "c"] {
            writer.write_all(part.as_bytes()).await.expect("write");
            writer.flush().await.expect("flush");
            let chunk = live.next_chunk().await.expect("chunk");
            assert_eq!(&chunk[..], part.as_bytes());
        }
        drop(writer);

        assert!(live.next_chunk().await.is_none());
        assert_eq!(captured.collect_text().await, "abc");
    }
}
