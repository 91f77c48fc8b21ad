//! Entity lifecycle: pending -> hydrating -> active -> failed/stopped,
//! hydration, the commit protocol, snapshots, and time-travel reads.
//! Generalizes a `Root<T>` / event-sourced repository get-then-save
//! cycle into the full state machine a long-lived, mailbox-serialized
//! entity needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::definition::{ChunkSender, Context, EntityDefinition};
use crate::error::{
    CommitError, DefinitionMismatchError, HydrationError, OutOfOrderEventsError, ResetError, RuntimeError,
    StoppedEntityError,
};
use crate::kernel;
use crate::mailbox::Mailbox;
use crate::metrics::Metrics;
use crate::patch::Patch;
use crate::rich::RichValue;
use crate::store::{self, EventEnvelope, SnapshotEnvelope, Store, StreamEndState, StreamEnvelope};
use crate::stream::StreamRun;
use crate::supervision::{Strategy, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Pending,
    Hydrating,
    Active,
    Failed,
    Stopped,
}

/// The state returned by [`Entity::state_at`]: a state value that may
/// belong to an older schema than the definition's current one.
#[derive(Debug, Clone)]
pub struct TimeTravelState {
    pub schema_version: u32,
    pub state: RichValue,
}

impl TimeTravelState {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, crate::error::RichError> {
        crate::rich::from_rich(&self.state)
    }
}

#[derive(Debug, Clone)]
pub struct EntitySnapshot<S> {
    pub state: S,
    pub version: u64,
}

struct EntityState<S> {
    status: EntityStatus,
    state: Option<S>,
    version: u64,
    error: Option<String>,
    last_touch: Instant,
}

/// A single, uniquely-identified entity instance: kernel + mailbox +
/// supervision + store, composed together.
pub struct Entity<S> {
    pub id: String,
    def: Arc<EntityDefinition<S>>,
    store: Option<Arc<dyn Store>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    metrics: Arc<dyn Metrics>,
    mailbox: Mailbox,
    inner: Mutex<EntityState<S>>,
    stream_run_counter: AtomicU64,
}

impl<S> Entity<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn pending(
        id: String,
        def: Arc<EntityDefinition<S>>,
        store: Option<Arc<dyn Store>>,
        supervisor: Option<Arc<dyn Supervisor>>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Entity {
            id,
            def,
            store,
            supervisor,
            metrics,
            mailbox: Mailbox::new(),
            inner: Mutex::new(EntityState {
                status: EntityStatus::Pending,
                state: None,
                version: 0,
                error: None,
                last_touch: Instant::now(),
            }),
            stream_run_counter: AtomicU64::new(0),
        }
    }

    /// Best-effort, non-enqueued read of whether this instance is
    /// terminal, used by the manager to decide whether `get(id)` should
    /// replace it. If the lock is currently held by an in-flight mailbox
    /// task, conservatively reports "not terminal" -- the next `get` will
    /// catch it once the task settles.
    pub(crate) fn is_terminal(&self) -> bool {
        match self.inner.try_lock() {
            Ok(guard) => matches!(guard.status, EntityStatus::Failed | EntityStatus::Stopped),
            Err(_) => false,
        }
    }

    /// Best-effort idle duration for the passivation sweeper. Returns
    /// `None` for entities already terminal (nothing to evict) or
    /// currently busy (skip this sweep, try again next interval).
    pub(crate) fn idle_duration(&self, now: Instant) -> Option<Duration> {
        match self.inner.try_lock() {
            Ok(guard) if matches!(guard.status, EntityStatus::Failed | EntityStatus::Stopped) => None,
            Ok(guard) => Some(now.duration_since(guard.last_touch)),
            Err(_) => None,
        }
    }

    fn touch(&self, guard: &mut EntityState<S>) {
        guard.last_touch = Instant::now();
    }

    fn check_alive(&self, guard: &EntityState<S>) -> Result<(), RuntimeError> {
        match guard.status {
            EntityStatus::Failed => Err(StoppedEntityError {
                id: self.id.clone(),
                status: "failed",
            }
            .into()),
            EntityStatus::Stopped => Err(StoppedEntityError {
                id: self.id.clone(),
                status: "stopped",
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Reconstructs state from the latest snapshot plus any events after
    /// it, applying upcasters as schema boundaries are crossed.
    async fn hydrate(&self, guard: &mut EntityState<S>) -> Result<(), HydrationError> {
        debug!(entity_id = %self.id, def = %self.def.name, "hydrating entity");
        guard.status = EntityStatus::Hydrating;

        let snapshot = match &self.store {
            Some(store) => store
                .get_latest_snapshot(&self.id)
                .await
                .map_err(HydrationError::Store)?,
            None => None,
        };

        let (mut rich_state, mut schema_version, base_version) = match snapshot {
            Some(snap) => {
                let envelope = store::decode_snapshot(&snap.data)?;
                if envelope.entity_def_name != self.def.name {
                    return Err(DefinitionMismatchError {
                        expected: self.def.name.clone(),
                        found: envelope.entity_def_name,
                    }
                    .into());
                }
                (envelope.state, envelope.schema_version, snap.version)
            }
            None => (self.def.initial_state_rich(), 1, 0),
        };

        let events = match &self.store {
            Some(store) => store
                .get_events(&self.id, base_version)
                .await
                .map_err(HydrationError::Store)?,
            None => Vec::new(),
        };

        let mut expected = base_version + 1;
        for event in &events {
            if event.version != expected {
                return Err(OutOfOrderEventsError {
                    expected,
                    found: event.version,
                }
                .into());
            }
            expected += 1;
        }

        for event in &events {
            let envelope = store::decode_event(&event.data)?;
            if envelope.schema_version > schema_version {
                rich_state = self.def.upcast(schema_version, envelope.schema_version, rich_state)?;
                schema_version = envelope.schema_version;
            }
            rich_state = envelope.patches.apply(&rich_state)?;
        }

        let current_schema = self.def.current_schema_version();
        if current_schema > schema_version {
            rich_state = self.def.upcast(schema_version, current_schema, rich_state)?;
        }

        let decoded: S = kernel::decode_state(&rich_state)?;
        guard.state = Some(decoded);
        guard.version = base_version + events.len() as u64;
        guard.status = EntityStatus::Active;
        info!(entity_id = %self.id, version = guard.version, "entity hydrated");
        Ok(())
    }

    async fn ensure_active(&self, guard: &mut EntityState<S>) -> Result<(), RuntimeError> {
        if guard.status == EntityStatus::Pending {
            if let Err(err) = self.hydrate(guard).await {
                guard.status = EntityStatus::Failed;
                guard.error = Some(err.to_string());
                error!(entity_id = %self.id, error = %err, "hydration failed");
                self.metrics.on_error(&self.id, &anyhow::anyhow!(err.to_string()));
                return Err(err.into());
            }
            self.metrics.on_hydrate(&self.id);
        }
        Ok(())
    }

    /// `send.<command>(...)`.
    pub async fn send(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        self.mailbox.enqueue(self.do_send(name, args)).await
    }

    async fn do_send(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        let mut guard = self.inner.lock().await;
        self.touch(&mut guard);
        self.check_alive(&guard)?;
        self.ensure_active(&mut guard).await?;

        let current_version = guard.version;
        let ctx = Context {
            entity_id: self.id.clone(),
            version: current_version,
        };
        let state = guard.state.clone().expect("active entity carries state");

        let outcome = match kernel::apply_command(&self.def, &state, name, args.clone(), &ctx).await {
            Ok(outcome) => outcome,
            Err(RuntimeError::Handler(err)) => return self.handle_supervision(&mut guard, err).await,
            Err(other) => return Err(other),
        };

        self.maybe_commit(&mut guard, name, args, current_version, outcome.patch, outcome.state, outcome.result)
            .await
    }

    /// Shared commit-or-noop tail used by both plain commands and
    /// completed stream runs: a stream handler's producer drains to
    /// completion first, then applies this same finalize -> commit rule
    /// exactly once using its final return value.
    async fn maybe_commit(
        &self,
        guard: &mut EntityState<S>,
        handler: &str,
        args: Vec<RichValue>,
        current_version: u64,
        patch: Patch,
        next_state: S,
        result: RichValue,
    ) -> Result<RichValue, RuntimeError> {
        let prior_state = guard.state.as_ref().expect("active entity carries state");
        let before_rich = crate::rich::to_rich(prior_state)?;
        let after_rich = crate::rich::to_rich(&next_state)?;

        if patch.is_empty() || crate::rich::deep_equal(&before_rich, &after_rich) {
            return Ok(result);
        }

        let Some(store) = self.store.clone() else {
            return Err(RuntimeError::NoStore);
        };

        let new_version = current_version + 1;
        let envelope = EventEnvelope {
            entity_def_name: self.def.name.clone(),
            schema_version: self.def.current_schema_version(),
            handler: handler.to_string(),
            payload: args,
            return_val: Some(result.clone()),
            patches: patch,
        };
        let data = store::encode_event(&envelope)?;

        match store.commit_event(&self.id, new_version, data).await {
            Ok(()) => {
                guard.state = Some(next_state);
                guard.version = new_version;
                debug!(entity_id = %self.id, handler, version = new_version, "event committed");
                self.metrics.on_after_commit(&self.id, new_version);
                self.maybe_snapshot(guard, false).await;
                Ok(result)
            }
            Err(err) => {
                guard.status = EntityStatus::Failed;
                guard.error = Some(err.to_string());
                warn!(entity_id = %self.id, handler, expected_version = new_version, error = %err, "commit conflict, entity marked failed");
                self.metrics.on_error(&self.id, &anyhow::anyhow!(err.to_string()));
                Err(RuntimeError::Commit(err))
            }
        }
    }

    async fn handle_supervision(
        &self,
        guard: &mut EntityState<S>,
        err: anyhow::Error,
    ) -> Result<RichValue, RuntimeError> {
        let Some(supervisor) = self.supervisor.clone() else {
            return Err(RuntimeError::Handler(err));
        };
        let state = guard.state.clone().expect("active entity carries state");
        let rich_state = crate::rich::to_rich(&state)?;

        match supervisor.strategy(&rich_state, &err) {
            Strategy::Resume => {
                debug!(entity_id = %self.id, error = %err, "handler error, supervisor resumes");
                Err(RuntimeError::Handler(err))
            }
            Strategy::Reset => {
                warn!(entity_id = %self.id, error = %err, "handler error, supervisor resets entity to initial state");
                if let Some(store) = &self.store {
                    let _ = store.clear_entity(&self.id).await;
                }
                let current_schema = self.def.current_schema_version();
                let rich = self.def.upcast(1, current_schema, self.def.initial_state_rich())?;
                let fresh: S = kernel::decode_state(&rich)?;
                guard.state = Some(fresh);
                guard.version = 0;
                guard.status = EntityStatus::Active;
                guard.error = None;
                self.metrics.on_error(&self.id, &err);
                Err(ResetError { source: err }.into())
            }
            Strategy::Stop => {
                error!(entity_id = %self.id, error = %err, "handler error, supervisor stops entity");
                guard.status = EntityStatus::Failed;
                guard.error = Some(err.to_string());
                self.metrics.on_error(&self.id, &err);
                Err(StoppedEntityError {
                    id: self.id.clone(),
                    status: "failed",
                }
                .into())
            }
        }
    }

    /// `read.<query>(...)`.
    pub async fn read(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        self.mailbox.enqueue(self.do_read(name, args)).await
    }

    async fn do_read(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        let mut guard = self.inner.lock().await;
        self.touch(&mut guard);
        self.check_alive(&guard)?;
        self.ensure_active(&mut guard).await?;
        let ctx = Context {
            entity_id: self.id.clone(),
            version: guard.version,
        };
        let state = guard.state.clone().expect("active entity carries state");
        kernel::run_query(&self.def, &state, name, args, &ctx).await
    }

    /// `snapshot()`: the current state and version, as seen
    /// after all previously enqueued writes.
    pub async fn snapshot(&self) -> Result<EntitySnapshot<S>, RuntimeError> {
        self.mailbox.enqueue(self.do_snapshot()).await
    }

    async fn do_snapshot(&self) -> Result<EntitySnapshot<S>, RuntimeError> {
        let mut guard = self.inner.lock().await;
        self.touch(&mut guard);
        self.check_alive(&guard)?;
        self.ensure_active(&mut guard).await?;
        Ok(EntitySnapshot {
            state: guard.state.clone().expect("active entity carries state"),
            version: guard.version,
        })
    }

    /// `stateAt(target)`.
    pub async fn state_at(&self, target: u64) -> Result<TimeTravelState, RuntimeError> {
        let Some(store) = self.store.clone() else {
            return Err(RuntimeError::NoStore);
        };
        self.mailbox.enqueue(self.do_state_at(store, target)).await
    }

    async fn do_state_at(&self, store: Arc<dyn Store>, target: u64) -> Result<TimeTravelState, RuntimeError> {
        let mut guard = self.inner.lock().await;
        self.touch(&mut guard);
        self.check_alive(&guard)?;

        let snapshot = store
            .get_latest_snapshot(&self.id)
            .await
            .map_err(HydrationError::Store)?;

        let (mut rich_state, mut schema_version, base_version) = match snapshot {
            Some(snap) if snap.version <= target => {
                let envelope = store::decode_snapshot(&snap.data)?;
                (envelope.state, envelope.schema_version, snap.version)
            }
            _ => (self.def.initial_state_rich(), 1, 0),
        };

        let events = store
            .get_events(&self.id, base_version)
            .await
            .map_err(HydrationError::Store)?;

        for event in events.iter().filter(|e| e.version <= target) {
            let envelope = store::decode_event(&event.data)?;
            if envelope.schema_version > schema_version {
                rich_state = self.def.upcast(schema_version, envelope.schema_version, rich_state)?;
                schema_version = envelope.schema_version;
            }
            rich_state = envelope.patches.apply(&rich_state)?;
        }

        Ok(TimeTravelState {
            schema_version,
            state: rich_state,
        })
    }

    async fn maybe_snapshot(&self, guard: &mut EntityState<S>, force: bool) {
        let Some(store) = &self.store else { return };
        let Some(cfg) = self.def.persistence else { return };
        let version = guard.version;
        if version == 0 {
            return;
        }
        if !force && version % cfg.snapshot_every != 0 {
            return;
        }
        let Some(state) = &guard.state else { return };

        self.metrics.on_before_snapshot(&self.id, version);
        let rich = match crate::rich::to_rich(state) {
            Ok(rich) => rich,
            Err(err) => {
                self.metrics.on_error(&self.id, &anyhow::anyhow!(err.to_string()));
                return;
            }
        };
        let envelope = SnapshotEnvelope {
            entity_def_name: self.def.name.clone(),
            schema_version: self.def.current_schema_version(),
            state: rich,
        };
        let data = match store::encode_snapshot(&envelope) {
            Ok(data) => data,
            Err(err) => {
                self.metrics.on_error(&self.id, &anyhow::anyhow!(err.to_string()));
                return;
            }
        };
        // Snapshot persistence errors are swallowed and surfaced only via
        // `onError` -- they must never fail the
        // originating command.
        match store.commit_snapshot(&self.id, version, data).await {
            Ok(()) => {
                debug!(entity_id = %self.id, version, "snapshot committed");
                self.metrics.on_snapshot(&self.id, version)
            }
            Err(err) => {
                warn!(entity_id = %self.id, version, error = %err, "snapshot commit failed, continuing from events");
                self.metrics.on_error(&self.id, &err)
            }
        }
    }

    /// Forces a checkpoint snapshot regardless of `snapshotEvery`, used by
    /// passivation before eviction.
    pub async fn force_snapshot(&self) {
        self.mailbox
            .enqueue(async {
                let mut guard = self.inner.lock().await;
                if matches!(guard.status, EntityStatus::Active) {
                    self.maybe_snapshot(&mut guard, true).await;
                }
            })
            .await
    }

    /// `stop()` on a reference: transitions to `stopped`. Idempotent and
    /// always resolves.
    pub async fn terminate(&self) {
        self.mailbox
            .enqueue(async {
                let mut guard = self.inner.lock().await;
                guard.status = EntityStatus::Stopped;
                info!(entity_id = %self.id, "entity stopped");
            })
            .await
    }
}

impl<S> Entity<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// `stream.<name>(...)`. The producer runs inside the
    /// mailbox for the run's whole lifetime; the returned [`StreamRun`]
    /// lets the caller consume chunks independently of that, decoupled by
    /// a single-item channel that also carries back-pressure.
    pub async fn stream(self: &Arc<Self>, name: &str, args: Vec<RichValue>) -> Result<StreamRun, RuntimeError> {
        {
            let guard = self.inner.lock().await;
            self.check_alive(&guard)?;
        }

        let run_id = self.stream_run_counter.fetch_add(1, Ordering::SeqCst);
        let stream_id = format!("{}:{}:{}", self.id, name, run_id);
        let (consumer_tx, consumer_rx) = mpsc::channel(1);
        let run = StreamRun::new(stream_id.clone(), consumer_rx);

        let this = Arc::clone(self);
        let handler_name = name.to_string();
        tokio::spawn(async move {
            this.mailbox
                .enqueue(this.drive_stream(stream_id, handler_name, args, consumer_tx))
                .await;
        });

        Ok(run)
    }

    /// Runs a stream handler to completion without a live external
    /// consumer, returning its final value ( "stream commands
    /// (tell-style, awaited)").
    pub async fn send_stream(&self, name: &str, args: Vec<RichValue>) -> Result<RichValue, RuntimeError> {
        let (tx, _rx) = mpsc::channel(1);
        let stream_id = format!("{}:{}:detached", self.id, name);
        self.mailbox
            .enqueue(self.drive_stream(stream_id, name.to_string(), args, tx))
            .await
    }

    async fn drive_stream(
        &self,
        stream_id: String,
        name: String,
        args: Vec<RichValue>,
        consumer_tx: mpsc::Sender<(u64, RichValue)>,
    ) -> Result<RichValue, RuntimeError> {
        let mut guard = self.inner.lock().await;
        self.touch(&mut guard);
        self.check_alive(&guard)?;
        self.ensure_active(&mut guard).await?;

        debug!(entity_id = %self.id, stream = %stream_id, handler = %name, "stream run starting");

        let current_version = guard.version;
        let ctx = Context {
            entity_id: self.id.clone(),
            version: current_version,
        };
        let state = guard.state.clone().expect("active entity carries state");

        let (raw_tx, mut raw_rx) = mpsc::channel::<RichValue>(1);
        let emit = ChunkSender(raw_tx);

        let handler_fut = kernel::start_stream(&self.def, &state, &name, args.clone(), &ctx, emit);
        let seq_store = self.store.clone();
        let relay_fut = async move {
            let mut seq: u64 = 0;
            while let Some(chunk) = raw_rx.recv().await {
                seq += 1;
                if let Some(store) = &seq_store {
                    let envelope = StreamEnvelope::Chunk { payload: chunk.clone() };
                    if let Ok(data) = store::encode_stream(&envelope) {
                        let _ = store.commit_event(&stream_id, seq, data).await;
                    }
                }
                // Detached mode: if the consumer already dropped its
                // receiver, keep draining the producer without waiting on
                // it again.
                let _ = consumer_tx.send((seq - 1, chunk)).await;
            }
            (seq, stream_id)
        };

        let (handler_result, (final_seq, stream_id)) = tokio::join!(handler_fut, relay_fut);

        let end_envelope = match &handler_result {
            Ok(outcome) => {
                debug!(entity_id = %self.id, stream = %stream_id, chunks = final_seq, "stream run completed");
                StreamEnvelope::End {
                    result: StreamEndState::Complete {
                        return_value: Some(outcome.result.clone()),
                    },
                }
            }
            Err(err) => {
                warn!(entity_id = %self.id, stream = %stream_id, chunks = final_seq, error = %err, "stream run failed");
                StreamEnvelope::End {
                    result: StreamEndState::Error { error: err.to_string() },
                }
            }
        };
        if let Some(store) = &self.store {
            if let Ok(data) = store::encode_stream(&end_envelope) {
                let _ = store.commit_event(&stream_id, final_seq + 1, data).await;
            }
        }

        let outcome = handler_result?;
        self.maybe_commit(
            &mut guard,
            &name,
            args,
            current_version,
            outcome.patch,
            outcome.state,
            outcome.result,
        )
        .await
    }
}
