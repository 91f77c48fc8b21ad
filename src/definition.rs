//! Entity definitions: the immutable schema-and-handler bundle that
//! specifies how an entity behaves.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::RichError;
use crate::patch::Draft;
use crate::rich::RichValue;

/// Ambient call context handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct Context {
    pub entity_id: String,
    /// The entity's version *before* this call is applied.
    pub version: u64,
}

/// A pure function migrating state from schema version `k` to `k+1`.
pub type Upcaster = Arc<dyn Fn(RichValue) -> Result<RichValue, RichError> + Send + Sync>;

/// Sends chunks from a running stream handler to its consumer.
#[derive(Clone)]
pub struct ChunkSender(pub(crate) mpsc::Sender<RichValue>);

impl ChunkSender {
    /// Yields one chunk to the stream's consumer, awaiting back-pressure.
    pub async fn send(&self, value: RichValue) -> Result<(), anyhow::Error> {
        self.0
            .send(value)
            .await
            .map_err(|_| anyhow::anyhow!("stream consumer channel closed"))
    }
}

/// A command handler mutates the draft and returns a value.
pub trait CommandHandlerDyn<S>: Send + Sync {
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>;
}

impl<S, F> CommandHandlerDyn<S> for F
where
    F: for<'a> Fn(&'a mut Draft<S>, Vec<RichValue>, &'a Context) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>> {
        self(draft, args, ctx)
    }
}

/// A query handler runs read-only against a draft; any mutation it makes
/// is discarded by the kernel.
pub trait QueryHandlerDyn<S>: Send + Sync {
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>;
}

impl<S, F> QueryHandlerDyn<S> for F
where
    F: for<'a> Fn(&'a mut Draft<S>, Vec<RichValue>, &'a Context) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>> {
        self(draft, args, ctx)
    }
}

/// A stream handler emits zero or more chunks via `emit`, then returns a
/// final value once the generator completes.
pub trait StreamHandlerDyn<S>: Send + Sync {
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
        emit: ChunkSender,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>;
}

impl<S, F> StreamHandlerDyn<S> for F
where
    F: for<'a> Fn(
            &'a mut Draft<S>,
            Vec<RichValue>,
            &'a Context,
            ChunkSender,
        ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        draft: &'a mut Draft<S>,
        args: Vec<RichValue>,
        ctx: &'a Context,
        emit: ChunkSender,
    ) -> BoxFuture<'a, Result<RichValue, anyhow::Error>> {
        self(draft, args, ctx, emit)
    }
}

pub(crate) enum HandlerEntry<S> {
    Command(Arc<dyn CommandHandlerDyn<S>>),
    Query(Arc<dyn QueryHandlerDyn<S>>),
    Stream(Arc<dyn StreamHandlerDyn<S>>),
}

impl<S> HandlerEntry<S> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            HandlerEntry::Command(_) => "command",
            HandlerEntry::Query(_) => "query",
            HandlerEntry::Stream(_) => "stream",
        }
    }
}

/// `persistence: { snapshotEvery }`.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceConfig {
    pub snapshot_every: u64,
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("entity definition '{0}' has no initial_state producer")]
    MissingInitialState(String),
    #[error("snapshotEvery must be a positive integer, got {0}")]
    InvalidSnapshotEvery(u64),
}

/// The immutable schema-and-handler bundle for one family of entities.
pub struct EntityDefinition<S> {
    pub name: String,
    initial_state: Arc<dyn Fn() -> RichValue + Send + Sync>,
    upcasters: Vec<Upcaster>,
    handlers: HashMap<String, HandlerEntry<S>>,
    pub persistence: Option<PersistenceConfig>,
}

impl<S> EntityDefinition<S> {
    /// Current schema version == upcasters.len() + 1.
    pub fn current_schema_version(&self) -> u32 {
        self.upcasters.len() as u32 + 1
    }

    pub fn initial_state_rich(&self) -> RichValue {
        (self.initial_state)()
    }

    /// Applies upcasters `from..to` in order, migrating a state value
    /// captured at schema `from` up to schema `to`.
    pub fn upcast(&self, from: u32, to: u32, mut value: RichValue) -> Result<RichValue, RichError> {
        for version in from..to {
            let upcaster = self
                .upcasters
                .get((version - 1) as usize)
                .expect("schema version within range of upcasters");
            value = upcaster(value)?;
        }
        Ok(value)
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&HandlerEntry<S>> {
        self.handlers.get(name)
    }

    pub fn handler_kind(&self, name: &str) -> Option<&'static str> {
        self.handlers.get(name).map(HandlerEntry::kind)
    }
}

/// Fluent builder: `define(name).initial_state(..).evolve(..)*.command(..)*
/// .query(..)*.stream(..)*.persistence(..)?.build()`.
pub struct EntityDefinitionBuilder<S> {
    name: String,
    initial_state: Option<Arc<dyn Fn() -> RichValue + Send + Sync>>,
    upcasters: Vec<Upcaster>,
    handlers: HashMap<String, HandlerEntry<S>>,
    persistence: Option<PersistenceConfig>,
}

/// Starts a new entity definition.
pub fn define<S>(name: impl Into<String>) -> EntityDefinitionBuilder<S> {
    EntityDefinitionBuilder::new(name)
}

impl<S> EntityDefinitionBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        EntityDefinitionBuilder {
            name: name.into(),
            initial_state: None,
            upcasters: Vec::new(),
            handlers: HashMap::new(),
            persistence: None,
        }
    }

    pub fn initial_state<F>(mut self, f: F) -> Self
    where
        F: Fn() -> RichValue + Send + Sync + 'static,
    {
        self.initial_state = Some(Arc::new(f));
        self
    }

    /// Registers an upcaster migrating the state produced by applying the
    /// previous `upcasters.len()` upcasters to the next schema version.
    pub fn evolve<F>(mut self, f: F) -> Self
    where
        F: Fn(RichValue) -> Result<RichValue, RichError> + Send + Sync + 'static,
    {
        self.upcasters.push(Arc::new(f));
        self
    }

    pub fn command(mut self, name: impl Into<String>, handler: impl CommandHandlerDyn<S> + 'static) -> Self {
        self.handlers
            .insert(name.into(), HandlerEntry::Command(Arc::new(handler)));
        self
    }

    pub fn query(mut self, name: impl Into<String>, handler: impl QueryHandlerDyn<S> + 'static) -> Self {
        self.handlers
            .insert(name.into(), HandlerEntry::Query(Arc::new(handler)));
        self
    }

    pub fn stream(mut self, name: impl Into<String>, handler: impl StreamHandlerDyn<S> + 'static) -> Self {
        self.handlers
            .insert(name.into(), HandlerEntry::Stream(Arc::new(handler)));
        self
    }

    pub fn persistence(mut self, snapshot_every: u64) -> Self {
        self.persistence = Some(PersistenceConfig { snapshot_every });
        self
    }

    pub fn build(self) -> Result<EntityDefinition<S>, DefinitionError> {
        let initial_state = self
            .initial_state
            .ok_or_else(|| DefinitionError::MissingInitialState(self.name.clone()))?;
        if let Some(cfg) = self.persistence {
            if cfg.snapshot_every == 0 {
                return Err(DefinitionError::InvalidSnapshotEvery(cfg.snapshot_every));
            }
        }
        Ok(EntityDefinition {
            name: self.name,
            initial_state,
            upcasters: self.upcasters,
            handlers: self.handlers,
            persistence: self.persistence,
        })
    }
}
