use std::sync::Arc;

use entity_runtime::definition::Context;
use entity_runtime::patch::Draft;
use entity_runtime::rich::{from_rich, to_rich};
use entity_runtime::{define, EntityDefinition, InMemoryStore, Manager, ManagerConfig, RichValue, RuntimeError};
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

fn get(draft: &mut Draft<CounterState>, _args: Vec<RichValue>, _ctx: &Context) -> BoxFuture<'_, Result<RichValue, anyhow::Error>> {
    Box::pin(async move { Ok(to_rich(&draft.count)?) })
}

fn counter_def() -> EntityDefinition<CounterState> {
    define("counter")
        .initial_state(|| to_rich(&CounterState::default()).unwrap())
        .command("Inc", inc)
        .query("Get", get)
        .build()
        .unwrap()
}

#[tokio::test]
async fn stop_is_idempotent_and_resolves_both_times_without_error() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store));

    let entity = manager.get("acct-1").unwrap();
    entity.send("Inc", vec![RichValue::Int(3)]).await.unwrap();

    manager.stop().await;
    manager.stop().await;
}

#[tokio::test]
async fn every_reference_operation_fails_with_manager_shutdown_after_stop() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store));

    let entity = manager.get("acct-2").unwrap();
    entity.send("Inc", vec![RichValue::Int(1)]).await.unwrap();

    manager.stop().await;

    assert!(matches!(
        entity.send("Inc", vec![RichValue::Int(1)]).await,
        Err(RuntimeError::ManagerShutdown(_))
    ));
    assert!(matches!(
        entity.read("Get", vec![]).await,
        Err(RuntimeError::ManagerShutdown(_))
    ));
    assert!(matches!(
        entity.snapshot().await,
        Err(RuntimeError::ManagerShutdown(_))
    ));
    assert!(matches!(
        entity.state_at(0).await,
        Err(RuntimeError::ManagerShutdown(_))
    ));
    assert!(matches!(
        entity.stream("Inc", vec![]).await,
        Err(RuntimeError::ManagerShutdown(_))
    ));
    assert!(matches!(
        entity.stop().await,
        Err(RuntimeError::ManagerShutdown(_))
    ));

    // `get` itself also rejects once the manager has shut down.
    assert!(manager.get("acct-3").is_err());
}
