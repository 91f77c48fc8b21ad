//! Durable streams: a running stream's consumer-facing handle, and reading
//! a stream's persisted log independently of any live run.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

use crate::rich::RichValue;
use crate::store::{self, Store, StreamEndState, StreamEnvelope};

/// One invocation of a stream handler. Iterating a
/// `StreamRun` pulls chunks as the producer emits them; breaking out of
/// the iteration early detaches the consumer without cancelling the
/// producer, which runs to completion regardless.
pub struct StreamRun {
    pub id: String,
    is_live: Arc<AtomicBool>,
    receiver: mpsc::Receiver<(u64, RichValue)>,
}

impl StreamRun {
    pub(crate) fn new(id: String, receiver: mpsc::Receiver<(u64, RichValue)>) -> Self {
        StreamRun {
            id,
            is_live: Arc::new(AtomicBool::new(true)),
            receiver,
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_live.load(Ordering::SeqCst)
    }

    /// Pulls the next chunk, or `None` once the run has ended.
    pub async fn next(&mut self) -> Option<RichValue> {
        match self.receiver.recv().await {
            Some((_, value)) => Some(value),
            None => {
                self.is_live.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Pulls the next chunk along with its sequence number.
    pub async fn next_with_seq(&mut self) -> Option<(u64, RichValue)> {
        match self.receiver.recv().await {
            Some(item) => Some(item),
            None => {
                self.is_live.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

impl Stream for StreamRun {
    type Item = RichValue;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some((_, value))) => Poll::Ready(Some(value)),
            Poll::Ready(None) => {
                self.is_live.store(false, Ordering::SeqCst);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Status of a durable-stream run, inspected from its persisted log's tail.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRunStatus {
    Running { seq: u64 },
    Complete { seq: u64, return_value: Option<RichValue> },
    Error { seq: u64, error: String },
}

/// `manager.streamStatus(streamId)`.
pub async fn stream_status(store: &dyn Store, stream_id: &str) -> Result<Option<StreamRunStatus>, anyhow::Error> {
    let events = store.get_events(stream_id, 0).await?;
    let Some(last) = events.last() else { return Ok(None) };
    let envelope = store::decode_stream(&last.data)?;
    let count = events.len() as u64;
    Ok(Some(match envelope {
        StreamEnvelope::Chunk { .. } => StreamRunStatus::Running { seq: count },
        StreamEnvelope::End {
            result: StreamEndState::Complete { return_value },
        } => StreamRunStatus::Complete {
            seq: count - 1,
            return_value,
        },
        StreamEnvelope::End {
            result: StreamEndState::Error { error },
        } => StreamRunStatus::Error { seq: count - 1, error },
    }))
}

/// A reader over a durable-stream's persisted log, resuming from a given
/// sequence number and terminating once it observes the `end` record.
pub struct StreamLogReader {
    receiver: mpsc::Receiver<(u64, RichValue)>,
}

impl StreamLogReader {
    pub async fn next(&mut self) -> Option<(u64, RichValue)> {
        self.receiver.recv().await
    }
}

impl Stream for StreamLogReader {
    type Item = (u64, RichValue);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resumes a durable-stream's persisted log from sequence `after` (default
/// 0), yielding each chunk payload with its sequence number, then
/// terminating when it observes the `end` record. Awaits the store's
/// wake-up channel when available; otherwise polls at a fixed short
/// interval.
pub fn read_stream(store: Arc<dyn Store>, stream_id: impl Into<String>, after: Option<u64>) -> StreamLogReader {
    let stream_id = stream_id.into();
    let (tx, rx) = mpsc::channel(16);
    let mut cursor = after.unwrap_or(0);

    tokio::spawn(async move {
        let notify = store.subscribe_events(&stream_id);
        loop {
            let events = match store.get_events(&stream_id, cursor).await {
                Ok(events) => events,
                Err(_) => break,
            };
            let mut ended = false;
            for event in events {
                cursor = event.version;
                let envelope = match store::decode_stream(&event.data) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        ended = true;
                        break;
                    }
                };
                match envelope {
                    StreamEnvelope::Chunk { payload } => {
                        if tx.send((cursor - 1, payload)).await.is_err() {
                            return;
                        }
                    }
                    StreamEnvelope::End { .. } => {
                        ended = true;
                        break;
                    }
                }
            }
            if ended {
                break;
            }
            match &notify {
                Some(notify) => notify.notified().await,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    });

    StreamLogReader { receiver: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn stream_status_is_none_for_unknown_stream() {
        let store = InMemoryStore::new();
        assert_eq!(stream_status(&store, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_status_reflects_running_then_complete() {
        let store = InMemoryStore::new();
        let chunk = StreamEnvelope::Chunk {
            payload: RichValue::Str("A".into()),
        };
        store
            .commit_event("s1", 1, store::encode_stream(&chunk).unwrap())
            .await
            .unwrap();
        assert_eq!(
            stream_status(&store, "s1").await.unwrap(),
            Some(StreamRunStatus::Running { seq: 1 })
        );

        let end = StreamEnvelope::End {
            result: StreamEndState::Complete { return_value: None },
        };
        store
            .commit_event("s1", 2, store::encode_stream(&end).unwrap())
            .await
            .unwrap();
        assert_eq!(
            stream_status(&store, "s1").await.unwrap(),
            Some(StreamRunStatus::Complete {
                seq: 1,
                return_value: None
            })
        );
    }

    #[tokio::test]
    async fn read_stream_yields_chunks_then_terminates() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let chunk_a = StreamEnvelope::Chunk {
            payload: RichValue::Str("A".into()),
        };
        let chunk_b = StreamEnvelope::Chunk {
            payload: RichValue::Str("B".into()),
        };
        let end = StreamEnvelope::End {
            result: StreamEndState::Complete { return_value: None },
        };
        store
            .commit_event("s2", 1, store::encode_stream(&chunk_a).unwrap())
            .await
            .unwrap();
        store
            .commit_event("s2", 2, store::encode_stream(&chunk_b).unwrap())
            .await
            .unwrap();
        store
            .commit_event("s2", 3, store::encode_stream(&end).unwrap())
            .await
            .unwrap();

        let mut reader = read_stream(store, "s2", None);
        assert_eq!(reader.next().await, Some((0, RichValue::Str("A".into()))));
        assert_eq!(reader.next().await, Some((1, RichValue::Str("B".into()))));
        assert_eq!(reader.next().await, None);
    }
}
