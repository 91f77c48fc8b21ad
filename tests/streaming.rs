use std::sync::Arc;
use std::time::Duration;

use entity_runtime::definition::{ChunkSender, Context};
use entity_runtime::patch::Draft;
use entity_runtime::rich::{from_rich, to_rich};
use entity_runtime::stream::StreamRunStatus;
use entity_runtime::{define, EntityDefinition, InMemoryStore, Manager, ManagerConfig, RichValue};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

mod common;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
struct BatchState {
    processed: i64,
}

fn process(
    draft: &mut Draft<BatchState>,
    args: Vec<RichValue>,
    _ctx: &Context,
    emit: ChunkSender,
) -> BoxFuture<'_, Result<RichValue, anyhow::Error>> {
    Box::pin(async move {
        let items: Vec<String> = from_rich(&args[0])?;
        let fail_at: String = from_rich(&args[1])?;
        for item in items {
            emit.send(RichValue::Str(format!("Processed {item}"))).await.ok();
            if item == fail_at {
                return Err(anyhow::anyhow!(format!("Failed at {item}")));
            }
            draft.processed += 1;
        }
        Ok(RichValue::Null)
    })
}

fn batch_def() -> EntityDefinition<BatchState> {
    define("batch")
        .initial_state(|| to_rich(&BatchState::default()).unwrap())
        .stream("process", process)
        .build()
        .unwrap()
}

#[tokio::test]
async fn a_failing_stream_emits_chunks_up_to_the_failure_then_leaves_no_commit() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(batch_def()).with_store(store));
    let entity = manager.get("job-1").unwrap();

    let items = RichValue::Array(vec![
        RichValue::Str("A".into()),
        RichValue::Str("B".into()),
        RichValue::Str("C".into()),
    ]);
    let mut run = entity
        .stream("process", vec![items, RichValue::Str("B".into())])
        .await
        .unwrap();

    assert_eq!(run.next().await, Some(RichValue::Str("Processed A".into())));
    assert_eq!(run.next().await, Some(RichValue::Str("Processed B".into())));
    assert_eq!(run.next().await, None);
    assert!(!run.is_live());

    let status = wait_for_status(&manager, &run.id).await;
    match status {
        Some(StreamRunStatus::Error { seq, error }) => {
            assert_eq!(seq, 2);
            assert!(error.contains("Failed at B"));
        }
        other => panic!("expected a persisted error status, got {other:?}"),
    }

    let snap = entity.snapshot().await.unwrap();
    assert_eq!(snap.state, BatchState::default());
    assert_eq!(snap.version, 0);
}

async fn wait_for_status(
    manager: &entity_runtime::Manager<BatchState>,
    stream_id: &str,
) -> Option<StreamRunStatus> {
    for _ in 0..20 {
        if let Ok(Some(status)) = manager.stream_status(stream_id).await {
            if !matches!(status, StreamRunStatus::Running { .. }) {
                return Some(status);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.stream_status(stream_id).await.ok().flatten()
}
