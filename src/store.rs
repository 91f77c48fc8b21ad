//! Store interface and persisted envelope shapes.
//!
//! The concrete persistence backend is a pluggable concern; what lives
//! here is the trait the core programs against plus [`InMemoryStore`],
//! a reference implementation good enough for tests and small
//! deployments. Ported naming (`ConflictError`) from an event-sourced
//! repository's store module, generalized from a single append-only
//! event log to an event log plus a latest-snapshot slot per entity,
//! with an optional wake-up channel for durable-stream readers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{CommitError, ConflictError};
use crate::patch::Patch;
use crate::rich::RichValue;

/// Reserved `entityDefName` for durable-stream event logs.
pub const STREAM_DEF_NAME: &str = "__stream__";

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub version: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub version: u64,
    pub data: Vec<u8>,
}

/// Opaque-to-the-store envelope wrapping one committed entity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub entity_def_name: String,
    pub schema_version: u32,
    pub handler: String,
    pub payload: Vec<RichValue>,
    pub return_val: Option<RichValue>,
    pub patches: Patch,
}

/// Opaque-to-the-store envelope wrapping a full-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub entity_def_name: String,
    pub schema_version: u32,
    pub state: RichValue,
}

/// One record in a durable-stream run's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum StreamEnvelope {
    Chunk { payload: RichValue },
    End { result: StreamEndState },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamEndState {
    Complete { return_value: Option<RichValue> },
    Error { error: String },
}

pub(crate) fn encode_event(envelope: &EventEnvelope) -> Result<Vec<u8>, crate::error::RichError> {
    serde_json::to_vec(envelope).map_err(|e| crate::error::RichError::Encode(e.into()))
}

pub(crate) fn decode_event(data: &[u8]) -> Result<EventEnvelope, crate::error::RichError> {
    serde_json::from_slice(data).map_err(|e| crate::error::RichError::Decode(e.into()))
}

pub(crate) fn encode_snapshot(envelope: &SnapshotEnvelope) -> Result<Vec<u8>, crate::error::RichError> {
    serde_json::to_vec(envelope).map_err(|e| crate::error::RichError::Encode(e.into()))
}

pub(crate) fn decode_snapshot(data: &[u8]) -> Result<SnapshotEnvelope, crate::error::RichError> {
    serde_json::from_slice(data).map_err(|e| crate::error::RichError::Decode(e.into()))
}

pub(crate) fn encode_stream(envelope: &StreamEnvelope) -> Result<Vec<u8>, crate::error::RichError> {
    serde_json::to_vec(envelope).map_err(|e| crate::error::RichError::Encode(e.into()))
}

pub(crate) fn decode_stream(data: &[u8]) -> Result<StreamEnvelope, crate::error::RichError> {
    serde_json::from_slice(data).map_err(|e| crate::error::RichError::Decode(e.into()))
}

/// Append-only event log plus latest-snapshot slot for every entity id,
/// shared by every entity of every definition using one manager.
#[async_trait]
pub trait Store: Send + Sync {
    /// Versions strictly greater than `from_version`, ascending, contiguous.
    async fn get_events(&self, entity_id: &str, from_version: u64) -> Result<Vec<EventRecord>, anyhow::Error>;

    /// Succeeds iff `version == current_max + 1`; otherwise a commit-version
    /// conflict.
    async fn commit_event(&self, entity_id: &str, version: u64, data: Vec<u8>) -> Result<(), CommitError>;

    async fn get_latest_snapshot(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, anyhow::Error>;

    /// Upsert; durable best-effort; may target a version not at the event
    /// log's current tail.
    async fn commit_snapshot(&self, entity_id: &str, version: u64, data: Vec<u8>) -> Result<(), anyhow::Error>;

    /// Deletes all events and snapshots for this id. Optional: the default
    /// no-op is a valid implementation for stores that don't support it,
    /// and callers (the `reset` supervision strategy) ignore its absence.
    async fn clear_entity(&self, _entity_id: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Returns a handle a durable-stream reader can await for wake-ups
    /// when new events are committed. `None` means the store doesn't
    /// support push notification; callers fall back to polling.
    fn subscribe_events(&self, _entity_id: &str) -> Option<Arc<Notify>> {
        None
    }
}

#[derive(Default)]
struct EntityLog {
    events: Vec<EventRecord>,
    snapshot: Option<SnapshotRecord>,
}

/// Reference `Store` implementation backed by a concurrent hash map. Not a
/// production backend -- it exists so tests and small deployments have
/// something to run against. Rejects non-contiguous commits, preserves
/// events across snapshots (so time-travel keeps working), and clones
/// data in and out to prevent aliasing between callers.
#[derive(Default)]
pub struct InMemoryStore {
    logs: DashMap<String, EntityLog>,
    wakers: DashMap<String, Arc<Notify>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_events(&self, entity_id: &str, from_version: u64) -> Result<Vec<EventRecord>, anyhow::Error> {
        Ok(self
            .logs
            .get(entity_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit_event(&self, entity_id: &str, version: u64, data: Vec<u8>) -> Result<(), CommitError> {
        let mut entry = self.logs.entry(entity_id.to_string()).or_default();
        let event_version = entry.events.last().map(|e| e.version).unwrap_or(0);
        let snapshot_version = entry.snapshot.as_ref().map(|s| s.version).unwrap_or(0);
        let current = event_version.max(snapshot_version);
        if version != current + 1 {
            return Err(ConflictError {
                expected: current + 1,
                actual: current,
            }
            .into());
        }
        entry.events.push(EventRecord { version, data });
        drop(entry);
        if let Some(notify) = self.wakers.get(entity_id) {
            notify.notify_waiters();
        }
        Ok(())
    }

    async fn get_latest_snapshot(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, anyhow::Error> {
        Ok(self.logs.get(entity_id).and_then(|log| log.snapshot.clone()))
    }

    async fn commit_snapshot(&self, entity_id: &str, version: u64, data: Vec<u8>) -> Result<(), anyhow::Error> {
        let mut entry = self.logs.entry(entity_id.to_string()).or_default();
        entry.snapshot = Some(SnapshotRecord { version, data });
        Ok(())
    }

    async fn clear_entity(&self, entity_id: &str) -> Result<(), anyhow::Error> {
        self.logs.remove(entity_id);
        Ok(())
    }

    fn subscribe_events(&self, entity_id: &str) -> Option<Arc<Notify>> {
        Some(
            self.wakers
                .entry(entity_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone(),
        )
    }
}
