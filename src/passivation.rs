//! Passivation: a background sweeper that evicts idle entities to reclaim
//! memory. The cancellable-background-task shape is generalized from a
//! daemon's shutdown sequencing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::entity::Entity;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct PassivationConfig {
    pub idle_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for PassivationConfig {
    fn default() -> Self {
        PassivationConfig {
            idle_after: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the sweeper's background task; dropping or cancelling it stops the
/// sweep without blocking process exit (unref-like semantics).
pub(crate) struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn<S>(
        registry: Arc<DashMap<String, Arc<Entity<S>>>>,
        config: PassivationConfig,
        metrics: Arc<dyn Metrics>,
        shutdown: Arc<AtomicBool>,
    ) -> Self
    where
        S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let now = Instant::now();
                let idle_ids: Vec<String> = registry
                    .iter()
                    .filter_map(|entry| {
                        entry
                            .value()
                            .idle_duration(now)
                            .filter(|idle| *idle > config.idle_after)
                            .map(|_| entry.key().clone())
                    })
                    .collect();

                for id in idle_ids {
                    if let Some((_, entity)) = registry.remove(&id) {
                        entity.force_snapshot().await;
                        entity.terminate().await;
                        debug!(entity_id = %id, "evicted idle entity");
                        metrics.on_evict(&id);
                    }
                }
            }
        });
        Sweeper { handle }
    }

    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}
