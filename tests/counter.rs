use std::sync::Arc;

use entity_runtime::definition::Context;
use entity_runtime::patch::Draft;
use entity_runtime::rich::{from_rich, to_rich};
use entity_runtime::{define, EntityDefinition, InMemoryStore, Manager, ManagerConfig, RichValue};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

mod common;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
struct CounterState {
    count: i64,
}

fn inc(draft: &mut Draft<CounterState>, args: Vec<RichValue>, _ctx: &Context) -> BoxFuture<'_, Result<RichValue, anyhow::Error>> {
    Box::pin(async move {
        let arg = args.get(0).ok_or_else(|| anyhow::anyhow!("Inc requires one argument"))?;
        let by: i64 = from_rich(arg)?;
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
async fn increments_accumulate_and_are_counted_as_versions() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store));
    let entity = manager.get("acct-1").unwrap();

    entity.send("Inc", vec![RichValue::Int(10)]).await.unwrap();
    entity.send("Inc", vec![RichValue::Int(5)]).await.unwrap();

    let result = entity.read("Get", vec![]).await.unwrap();
    assert_eq!(result, RichValue::Int(15));

    let snap = entity.snapshot().await.unwrap();
    assert_eq!(snap.version, 2);
    assert_eq!(snap.state.count, 15);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ValueState {
    value: i64,
}

fn set_value(draft: &mut Draft<ValueState>, args: Vec<RichValue>, _ctx: &Context) -> BoxFuture<'_, Result<RichValue, anyhow::Error>> {
    Box::pin(async move {
        let new_value: i64 = from_rich(&args[0])?;
        draft.value = new_value;
        Ok(RichValue::Null)
    })
}

fn value_def() -> EntityDefinition<ValueState> {
    define("value-holder")
        .initial_state(|| to_rich(&ValueState { value: 10 }).unwrap())
        .command("SetValue", set_value)
        .build()
        .unwrap()
}

#[tokio::test]
async fn setting_the_same_value_is_a_noop_commit() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(value_def()).with_store(store));
    let entity = manager.get("v-1").unwrap();

    entity.send("SetValue", vec![RichValue::Int(10)]).await.unwrap();

    let snap = entity.snapshot().await.unwrap();
    assert_eq!(snap.version, 0);
    assert_eq!(snap.state.value, 10);
}

#[tokio::test]
async fn a_failed_send_leaves_version_and_state_unchanged() {
    common::init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let manager = Manager::create(ManagerConfig::new(counter_def()).with_store(store));
    let entity = manager.get("acct-2").unwrap();

    entity.send("Inc", vec![RichValue::Int(5)]).await.unwrap();
    let before = entity.snapshot().await.unwrap();

    // Missing argument trips the handler's own `from_rich` failure.
    let err = entity.send("Inc", vec![]).await;
    assert!(err.is_err());

    let after = entity.snapshot().await.unwrap();
    assert_eq!(before.version, after.version);
    assert_eq!(before.state, after.state);
}
