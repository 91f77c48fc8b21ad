//! An in-process event-sourced entity runtime: a virtual-actor framework
//! where every entity is identified by a string id, exactly one logical
//! handler runs per id at a time, every mutation is captured as a
//! structural patch against the prior state, and the full history can be
//! persisted, rehydrated, and time-traveled.
//!
//! The four subsystems map onto this crate's modules:
//!
//! - the **state kernel** ([`kernel`], [`patch`], [`rich`]) — draft
//!   command/query/stream execution producing structural patches and
//!   deep-equality checks;
//! - the **entity lifecycle** ([`entity`], [`mailbox`], [`supervision`]) —
//!   pending -> hydrating -> active -> failed/stopped, mailbox
//!   serialization, supervision, passivation;
//! - the **persistence protocol** ([`store`], [`stream`]) — optimistically
//!   versioned event log with snapshots, schema evolution via upcasters,
//!   and durable streams;
//! - the **manager** ([`manager`], [`passivation`]) — per-definition
//!   registry, passivation sweeper, external reference proxies.

pub mod definition;
pub mod entity;
pub mod error;
pub mod kernel;
pub mod mailbox;
pub mod manager;
pub mod metrics;
pub mod passivation;
pub mod patch;
pub mod rich;
pub mod store;
pub mod stream;
pub mod supervision;

pub use definition::{define, Context, EntityDefinition, EntityDefinitionBuilder, PersistenceConfig};
pub use entity::{Entity, EntitySnapshot, EntityStatus, TimeTravelState};
pub use error::RuntimeError;
pub use manager::{EntityRef, Manager, ManagerConfig};
pub use metrics::{Metrics, NoopMetrics};
pub use passivation::PassivationConfig;
pub use patch::{Draft, Patch};
pub use rich::RichValue;
pub use store::{InMemoryStore, Store};
pub use stream::{StreamLogReader, StreamRun, StreamRunStatus};
pub use supervision::{Strategy, Supervisor, SupervisorBuilder};
