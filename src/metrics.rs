//! Optional observability hooks.

/// Fired at hydrate, snapshot, commit, eviction, and error points in an
/// entity's lifecycle. Every method has a no-op default so callers only
/// implement what they care about.
pub trait Metrics: Send + Sync {
    fn on_hydrate(&self, _entity_id: &str) {}
    fn on_before_snapshot(&self, _entity_id: &str, _version: u64) {}
    fn on_snapshot(&self, _entity_id: &str, _version: u64) {}
    fn on_after_commit(&self, _entity_id: &str, _version: u64) {}
    fn on_evict(&self, _entity_id: &str) {}
    fn on_error(&self, _entity_id: &str, _error: &anyhow::Error) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
