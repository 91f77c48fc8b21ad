use std::sync::Arc;

use entity_runtime::definition::Context;
use entity_runtime::patch::Draft;
use entity_runtime::rich::{from_rich, to_rich};
use entity_runtime::{define, EntityDefinition, InMemoryStore, Manager, ManagerConfig, RichValue, Store};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

mod common;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
struct CounterState {
    count: i64,
}

fn inc(draft: &mut Draft<CounterState>, args: Vec<RichValue>, _ctx: &Context) -> BoxFuture<'_, Result<RichValue, anyhow::Error>> {
    Box::pin(async move {
        let by: i64 = from_rich(&args[0])?;
        draft.count += by;
        Ok(RichValue::Null)
    })
}

fn counter_def() -> EntityDefinition<CounterState> {
    define("counter")
        .initial_state(|| to_rich(&CounterState::default()).unwrap())
        .command("Inc", inc)
        .build()
        .unwrap()
}

#[tokio::test]
async fn a_fresh_manager_rehydrates_state_from_the_shared_store() {
    common::init_tracing();
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());

    {
        let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store.clone()));
        let entity = manager.get("acct-1").unwrap();
        entity.send("Inc", vec![RichValue::Int(22)]).await.unwrap();
        entity.send("Inc", vec![RichValue::Int(-20)]).await.unwrap();
        manager.stop().await;
    }

    let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store));
    let entity = manager.get("acct-1").unwrap();
    let snap = entity.snapshot().await.unwrap();
    assert_eq!(snap.state.count, 2);
    assert_eq!(snap.version, 2);
}

#[tokio::test]
async fn snapshots_accelerate_hydration_without_changing_the_result() {
    common::init_tracing();
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let def = || define("counter").initial_state(|| to_rich(&CounterState::default()).unwrap()).command("Inc", inc).persistence(2).build().unwrap();

    {
        let manager = Manager::create(ManagerConfig::new(def()).with_store(store.clone()));
        let entity = manager.get("acct-2").unwrap();
        for _ in 0..5 {
            entity.send("Inc", vec![RichValue::Int(1)]).await.unwrap();
        }
        manager.stop().await;
    }

    assert!(store.get_latest_snapshot("acct-2").await.unwrap().is_some());

    let manager = Manager::create(ManagerConfig::new(def()).with_store(store));
    let entity = manager.get("acct-2").unwrap();
    let snap = entity.snapshot().await.unwrap();
    assert_eq!(snap.state.count, 5);
    assert_eq!(snap.version, 5);
}
