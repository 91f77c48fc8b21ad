//! The per-definition registry, external reference proxy and durable
//! stream reader entry points. The registry is generalized from a
//! single-aggregate repository to a multi-entity registry keyed by
//! entity id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::definition::EntityDefinition;
use crate::entity::{Entity, EntitySnapshot, TimeTravelState};
use crate::error::{ManagerShutdownError, RuntimeError};
use crate::metrics::{Metrics, NoopMetrics};
use crate::passivation::{PassivationConfig, Sweeper};
use crate::rich::RichValue;
use crate::store::Store;
use crate::stream::{self, StreamLogReader, StreamRun, StreamRunStatus};
use crate::supervision::Supervisor;

/// `manager.create({ definition, store?, supervisor?, metrics?,
/// passivation? })`.
pub struct ManagerConfig<S> {
    pub definition: EntityDefinition<S>,
    pub store: Option<Arc<dyn Store>>,
    pub supervisor: Option<Arc<dyn Supervisor>>,
    pub metrics: Option<Arc<dyn Metrics>>,
    pub passivation: Option<PassivationConfig>,
}

impl<S> ManagerConfig<S> {
    pub fn new(definition: EntityDefinition<S>) -> Self {
        ManagerConfig {
            definition,
            store: None,
            supervisor: None,
            metrics: None,
            passivation: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_passivation(mut self, passivation: PassivationConfig) -> Self {
        self.passivation = Some(passivation);
        self
    }
}

/// Registry of entities for one definition; provides external references,
/// the durable-stream reader, and orderly shutdown.
pub struct Manager<S> {
    def: Arc<EntityDefinition<S>>,
    store: Option<Arc<dyn Store>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    metrics: Arc<dyn Metrics>,
    registry: Arc<DashMap<String, Arc<Entity<S>>>>,
    sweeper: Option<Sweeper>,
    shutdown: Arc<AtomicBool>,
}

impl<S> Manager<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn create(config: ManagerConfig<S>) -> Arc<Self> {
        let def = Arc::new(config.definition);
        let metrics = config.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let registry: Arc<DashMap<String, Arc<Entity<S>>>> = Arc::new(DashMap::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let sweeper = config.passivation.map(|cfg| {
            Sweeper::spawn(
                Arc::clone(&registry),
                cfg,
                Arc::clone(&metrics),
                Arc::clone(&shutdown),
            )
        });

        info!(definition = %def.name, "manager created");
        Arc::new(Manager {
            def,
            store: config.store,
            supervisor: config.supervisor,
            metrics,
            registry,
            sweeper,
            shutdown,
        })
    }

    fn spawn_entity(&self, id: String) -> Arc<Entity<S>> {
        Arc::new(Entity::pending(
            id,
            Arc::clone(&self.def),
            self.store.clone(),
            self.supervisor.clone(),
            Arc::clone(&self.metrics),
        ))
    }

    /// `manager.get(id)`: lazily creates an entity on
    /// first retrieval, and transparently replaces a failed/stopped
    /// instance with a fresh one (which will rehydrate from persisted
    /// state on its next interaction).
    pub fn get(&self, id: impl Into<String>) -> Result<EntityRef<S>, ManagerShutdownError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ManagerShutdownError);
        }
        let id = id.into();

        let needs_replace = self
            .registry
            .get(&id)
            .map(|entity| entity.is_terminal())
            .unwrap_or(false);
        if needs_replace {
            self.registry.remove(&id);
        }

        let entity = self
            .registry
            .entry(id.clone())
            .or_insert_with(|| self.spawn_entity(id))
            .clone();

        Ok(EntityRef {
            entity,
            shutdown: Arc::clone(&self.shutdown),
        })
    }

    /// `manager.readStream(streamId, { after? })`.
    pub fn read_stream(&self, stream_id: impl Into<String>, after: Option<u64>) -> Result<StreamLogReader, RuntimeError> {
        let store = self.store.clone().ok_or(RuntimeError::NoStore)?;
        Ok(stream::read_stream(store, stream_id, after))
    }

    /// `manager.streamStatus(streamId)`.
    pub async fn stream_status(&self, stream_id: &str) -> Result<Option<StreamRunStatus>, RuntimeError> {
        let store = self.store.clone().ok_or(RuntimeError::NoStore)?;
        stream::stream_status(store.as_ref(), stream_id)
            .await
            .map_err(|e| RuntimeError::Handler(e))
    }

    /// `manager.stop()`: idempotent, drains pending tasks
    /// with best effort.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(sweeper) = &self.sweeper {
            sweeper.cancel();
        }
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        info!(definition = %self.def.name, entities = ids.len(), "manager stopping");
        for id in ids {
            if let Some((_, entity)) = self.registry.remove(&id) {
                entity.terminate().await;
            }
        }
    }
}

/// An external reference to one entity: `send.<cmd>`, `read.<q>`,
/// `stream.<s>`, `snapshot`, `stateAt`, `stop`.
pub struct EntityRef<S> {
    entity: Arc<Entity<S>>,
    shutdown: Arc<AtomicBool>,
}

impl<S> EntityRef<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn check_shutdown(&self) -> Result<(), RuntimeError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(RuntimeError::ManagerShutdown(ManagerShutdownError));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.entity.id
    }

    pub async fn send(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        self.check_shutdown()?;
        self.entity.send(name, args).await
    }

    pub async fn read(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        self.check_shutdown()?;
        self.entity.read(name, args).await
    }

    pub async fn stream(&self, name: &str, args: Vec<RichValue>) -> Result<StreamRun, RuntimeError> {
        self.check_shutdown()?;
        self.entity.stream(name, args).await
    }

    pub async fn send_stream(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        self.check_shutdown()?;
        self.entity.send_stream(name, args).await
    }

    pub async fn snapshot(&self) -> Result<EntitySnapshot<S>, RuntimeError> {
        self.check_shutdown()?;
        self.entity.snapshot().await
    }

    pub async fn state_at(&self, target: u64) -> Result<TimeTravelState, RuntimeError> {
        self.check_shutdown()?;
        self.entity.state_at(target).await
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.check_shutdown()?;
        self.entity.terminate().await;
        Ok(())
    }
}
