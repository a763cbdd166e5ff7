//! Task engine: the transactional half of the state machine, match engine,
//! trigger builder and replay.
//!
//! Every public operation runs in one short transaction. Terminal events
//! written during the operation are fed back to the match engine inside the
//! same transaction until nothing new fires, so a batch commits together with
//! its downstream consequences. Limiter usage and event publication happen
//! after commit through [`PostCommitHooks`].

pub mod create;
pub mod durable;
pub mod error;
pub mod finalize;
pub mod lease;
pub mod matching;
pub mod release;
pub mod replay;
pub mod sweep;
pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tasklane_types::config::EngineConfig;
use tasklane_types::event::{CandidateEvent, NewTaskEvent, TaskEvent};
use tasklane_types::payload::{PayloadKey, PayloadType, StorePayload};
use tasklane_types::task::TenantId;
use tasklane_types::workflow::{JobKind, WorkflowVersion};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::event::EventBus;
use crate::expression::CachedEvaluator;
use crate::graph::StepGraph;
use crate::hooks::PostCommitHooks;
use crate::limiter::{MeteredResource, TenantLimiter, UnmeteredLimiter};
use crate::repository::Gateway;

pub use create::{CreateTaskOpts, ReplayTaskOpts};
pub use durable::{DurableWait, DurableWaitOpts};
pub use error::EngineError;
pub use release::{CancelTaskOpts, CompleteTaskOpts, FailOutcome, FailTaskOpts};
pub use replay::{run_lock_name, ReplayResult, REPLAY_LOCK};
pub use sweep::SweepResult;
pub use trigger::{TriggerOpts, TriggeredRun};

/// Current time at the precision rows are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Payload(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Payload(e.to_string()))
}

// ---------------------------------------------------------------------------
// Transaction context
// ---------------------------------------------------------------------------

/// State carried through one engine transaction.
pub struct TxContext<T> {
    pub(crate) tx: T,
    pub(crate) tenant: TenantId,
    /// Events written so far, published after commit.
    pub(crate) events: Vec<TaskEvent>,
    /// Internal candidate events not yet offered to the match engine.
    pub(crate) pending: Vec<CandidateEvent>,
    metered: HashMap<MeteredResource, usize>,
}

impl<T> TxContext<T> {
    fn new(tx: T, tenant: TenantId) -> Self {
        Self {
            tx,
            tenant,
            events: Vec::new(),
            pending: Vec::new(),
            metered: HashMap::new(),
        }
    }

    pub(crate) fn meter(&mut self, resource: MeteredResource, amount: usize) {
        if amount > 0 {
            *self.metered.entry(resource).or_default() += amount;
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The engine over a storage gateway.
///
/// Generic over the gateway so tasklane-core never depends on tasklane-infra.
pub struct TaskEngine<G: Gateway> {
    gateway: Arc<G>,
    config: EngineConfig,
    evaluator: Arc<CachedEvaluator>,
    versions: TtlCache<(TenantId, Uuid), Option<Arc<WorkflowVersion>>>,
    queues: TtlCache<(TenantId, String), ()>,
    limiter: Arc<dyn TenantLimiter>,
    bus: EventBus,
}

impl<G: Gateway> TaskEngine<G> {
    pub fn new(gateway: Arc<G>, config: EngineConfig) -> Self {
        let caches = &config.caches;
        Self {
            evaluator: Arc::new(CachedEvaluator::jexl(Duration::from_secs(caches.expressions_secs))),
            versions: TtlCache::new(Duration::from_secs(caches.workflow_versions_secs)),
            queues: TtlCache::new(Duration::from_secs(caches.queues_secs)),
            limiter: Arc::new(UnmeteredLimiter),
            bus: EventBus::new(config.event_bus_capacity),
            gateway,
            config,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn TenantLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<CachedEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &CachedEvaluator {
        &self.evaluator
    }

    /// Subscribe to committed task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.bus.subscribe()
    }

    /// Store a workflow version after validating its step graph.
    #[tracing::instrument(skip(self, version), fields(tenant_id = %tenant, version_id = %version.id))]
    pub async fn put_workflow_version(
        &self,
        tenant: TenantId,
        version: &WorkflowVersion,
    ) -> Result<(), EngineError> {
        StepGraph::build(&version.steps).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        let on_failure = version
            .steps
            .iter()
            .filter(|s| s.job_kind == JobKind::OnFailure)
            .collect::<Vec<_>>();
        if on_failure.len() > 1 {
            return Err(EngineError::InvalidInput(
                "a workflow version has at most one on-failure step".to_string(),
            ));
        }
        if on_failure.iter().any(|s| !s.parents.is_empty()) {
            return Err(EngineError::InvalidInput(
                "the on-failure step cannot declare parents".to_string(),
            ));
        }

        let mut ctx = self.begin(tenant).await?;
        self.gateway
            .put_workflow_version(&mut ctx.tx, tenant, version)
            .await?;
        self.finish(ctx).await?;
        self.versions.invalidate(&(tenant, version.id));
        tracing::info!(steps = version.steps.len(), "workflow version stored");
        Ok(())
    }

    /// A stored workflow version, served from the version cache when fresh.
    pub async fn get_workflow_version(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Arc<WorkflowVersion>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let version = self.load_version(&mut ctx, id).await;
        self.gateway.rollback(ctx.tx).await?;
        version
    }

    /// Offer external (user) or synthetic candidate events to the match
    /// engine. Returns the task events the cascade wrote.
    #[tracing::instrument(skip(self, events), fields(tenant_id = %tenant, count = events.len()))]
    pub async fn process_events(
        &self,
        tenant: TenantId,
        events: Vec<CandidateEvent>,
    ) -> Result<Vec<TaskEvent>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        ctx.pending.extend(events);
        self.finish(ctx).await
    }

    // -----------------------------------------------------------------------
    // Transaction plumbing
    // -----------------------------------------------------------------------

    pub(crate) async fn begin(&self, tenant: TenantId) -> Result<TxContext<G::Tx>, EngineError> {
        let tx = self.gateway.begin().await?;
        Ok(TxContext::new(tx, tenant))
    }

    /// Drain pending candidates, check the limiter, commit and run the
    /// post-commit hooks. Returns the events written in the transaction.
    pub(crate) async fn finish(
        &self,
        mut ctx: TxContext<G::Tx>,
    ) -> Result<Vec<TaskEvent>, EngineError> {
        loop {
            let batch = std::mem::take(&mut ctx.pending);
            if batch.is_empty() {
                break;
            }
            self.process_candidates(&mut ctx, batch).await?;
        }

        let TxContext {
            tx,
            tenant,
            events,
            metered,
            ..
        } = ctx;

        for (resource, amount) in &metered {
            if let Err(err) = self.limiter.check(tenant, *resource, *amount) {
                self.gateway.rollback(tx).await?;
                return Err(EngineError::ResourceExhausted(err.to_string()));
            }
        }

        self.gateway.commit(tx).await?;

        let mut hooks = PostCommitHooks::new();
        for (resource, amount) in metered {
            let limiter = Arc::clone(&self.limiter);
            hooks.push("limiter.record", move || limiter.record(tenant, resource, amount));
        }
        if !events.is_empty() {
            let bus = self.bus.clone();
            let published = events.clone();
            hooks.push("event_bus.publish", move || {
                for event in published {
                    bus.publish(event);
                }
            });
        }
        if !hooks.is_empty() {
            let _ = hooks.run();
        }

        Ok(events)
    }

    /// Append task events, store their data and queue the terminal ones of
    /// current attempts as candidates.
    pub(crate) async fn write_events(
        &self,
        ctx: &mut TxContext<G::Tx>,
        new_events: Vec<NewTaskEvent>,
    ) -> Result<Vec<TaskEvent>, EngineError> {
        if new_events.is_empty() {
            return Ok(Vec::new());
        }
        let written = self
            .gateway
            .insert_events(&mut ctx.tx, ctx.tenant, &new_events)
            .await?;

        let payloads: Vec<StorePayload> = written
            .iter()
            .zip(&new_events)
            .map(|(event, new)| StorePayload {
                key: PayloadKey::new(event.id, event.inserted_at, PayloadType::TaskEventData),
                value: new.data.clone(),
            })
            .collect();
        self.gateway
            .store_payloads(&mut ctx.tx, ctx.tenant, &payloads)
            .await?;

        for (event, new) in written.iter().zip(new_events) {
            if event.is_current_retry && event.event_type.is_terminal() {
                ctx.pending.push(CandidateEvent::internal(
                    event.event_type,
                    event.task_external_id,
                    new.data,
                ));
            }
        }
        ctx.meter(MeteredResource::Event, written.len());
        ctx.events.extend(written.iter().cloned());
        Ok(written)
    }

    /// Workflow versions by id through the version cache. Missing versions
    /// are cached negatively and left out of the result.
    pub(crate) async fn load_versions(
        &self,
        ctx: &mut TxContext<G::Tx>,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Arc<WorkflowVersion>>, EngineError> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            if found.contains_key(id) || missing.contains(id) {
                continue;
            }
            match self.versions.get(&(ctx.tenant, *id)) {
                Some(Some(version)) => {
                    found.insert(*id, version);
                }
                Some(None) => {}
                None => missing.push(*id),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let loaded = self
            .gateway
            .get_workflow_versions(&mut ctx.tx, ctx.tenant, &missing)
            .await?;
        for version in loaded {
            let version = Arc::new(version);
            self.versions
                .insert((ctx.tenant, version.id), Some(Arc::clone(&version)));
            found.insert(version.id, version);
        }
        for id in missing {
            if !found.contains_key(&id) {
                tracing::debug!(version_id = %id, "workflow version not found");
                self.versions.insert((ctx.tenant, id), None);
            }
        }
        Ok(found)
    }

    pub(crate) async fn load_version(
        &self,
        ctx: &mut TxContext<G::Tx>,
        id: Uuid,
    ) -> Result<Arc<WorkflowVersion>, EngineError> {
        self.load_versions(ctx, &[id])
            .await?
            .remove(&id)
            .ok_or(EngineError::UnknownWorkflowVersion(id))
    }

    /// Ensure queues exist, skipping the ones seen recently.
    pub(crate) async fn ensure_queues(
        &self,
        ctx: &mut TxContext<G::Tx>,
        names: impl IntoIterator<Item = String>,
    ) -> Result<(), EngineError> {
        let mut unseen: Vec<String> = Vec::new();
        for name in names {
            if self.queues.get(&(ctx.tenant, name.clone())).is_none() && !unseen.contains(&name) {
                unseen.push(name);
            }
        }
        if unseen.is_empty() {
            return Ok(());
        }
        self.gateway
            .ensure_queues(&mut ctx.tx, ctx.tenant, &unseen)
            .await?;
        for name in unseen {
            self.queues.insert((ctx.tenant, name), ());
        }
        Ok(())
    }
}

impl<G: Gateway> std::fmt::Debug for TaskEngine<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.config)
            .field("versions", &self.versions)
            .field("queues", &self.queues)
            .field("bus", &self.bus)
            .finish()
    }
}
