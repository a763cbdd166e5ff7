//! End-to-end engine scenarios against a real SQLite database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tasklane_core::engine::{
    run_lock_name, CancelTaskOpts, CompleteTaskOpts, DurableWaitOpts, FailTaskOpts, TriggerOpts,
    REPLAY_LOCK,
};
use tasklane_core::limiter::{LimitExceeded, MeteredResource, TenantLimiter};
use tasklane_core::repository::{
    PayloadStore, TaskEventRepository, TaskRepository, Transactional, WorkflowRepository,
};
use tasklane_core::trigger::run_key;
use tasklane_core::{EngineError, TaskEngine};
use tasklane_types::config::EngineConfig;
use tasklane_types::dag::RunStatus;
use tasklane_types::event::{CandidateEvent, TaskEvent, TaskEventType};
use tasklane_types::matching::MatchAction;
use tasklane_types::payload::{PayloadKey, PayloadType};
use tasklane_types::task::{ParentLink, Task, TaskInput, TaskStatus, TenantId};
use tasklane_types::workflow::{
    JobKind, StepCondition, StepConditionKind, StepDefinition, WorkflowVersion,
};
use uuid::Uuid;

use super::{DatabasePool, SqliteGateway};

type Engine = TaskEngine<SqliteGateway>;

async fn test_engine(config: EngineConfig) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    std::mem::forget(dir);
    let pool = DatabasePool::new(&url).await.unwrap();
    TaskEngine::new(Arc::new(SqliteGateway::new(pool)), config)
}

fn step(readable_id: &str, parents: &[&str]) -> StepDefinition {
    let mut step = StepDefinition::new(readable_id, format!("run:{readable_id}"));
    step.parents = parents.iter().map(|p| p.to_string()).collect();
    step
}

fn user_condition(key: &str, group: Uuid, expression: &str) -> StepCondition {
    StepCondition {
        or_group_id: group,
        readable_data_key: key.to_string(),
        action: MatchAction::Queue,
        expression: expression.to_string(),
        kind: StepConditionKind::UserEvent {
            event_key: key.to_string(),
        },
    }
}

async fn put_version(engine: &Engine, tenant: TenantId, steps: Vec<StepDefinition>) -> WorkflowVersion {
    let version = WorkflowVersion {
        id: Uuid::now_v7(),
        workflow_id: Uuid::now_v7(),
        workflow_name: "orders".to_string(),
        steps,
    };
    engine.put_workflow_version(tenant, &version).await.unwrap();
    version
}

async fn trigger(engine: &Engine, tenant: TenantId, opts: TriggerOpts) -> tasklane_core::engine::TriggeredRun {
    engine
        .trigger_workflow_runs(tenant, vec![opts])
        .await
        .unwrap()
        .remove(0)
}

/// Tasks of a run keyed by step readable id.
async fn run_tasks(engine: &Engine, tenant: TenantId, run_id: Uuid) -> HashMap<String, Task> {
    let gateway = engine.gateway();
    let mut tx = gateway.begin().await.unwrap();
    let tasks = gateway
        .list_tasks_for_runs(&mut tx, tenant, &[run_id])
        .await
        .unwrap();
    gateway.rollback(tx).await.unwrap();
    tasks
        .into_iter()
        .map(|t| (t.step_readable_id.clone(), t))
        .collect()
}

async fn task_input(engine: &Engine, tenant: TenantId, task: &Task) -> TaskInput {
    let gateway = engine.gateway();
    let key = PayloadKey::new(task.id, task.inserted_at, PayloadType::TaskInput);
    let mut tx = gateway.begin().await.unwrap();
    let mut found = gateway.retrieve_payloads(&mut tx, tenant, &[key]).await.unwrap();
    gateway.rollback(tx).await.unwrap();
    serde_json::from_value(found.remove(&key).unwrap()).unwrap()
}

async fn complete(engine: &Engine, tenant: TenantId, task: &Task, output: Value) -> Vec<Task> {
    engine
        .complete_tasks(
            tenant,
            vec![CompleteTaskOpts {
                task: task.attempt(),
                output,
            }],
        )
        .await
        .unwrap()
}

async fn task_events(
    engine: &Engine,
    tenant: TenantId,
    task: &Task,
    event_type: TaskEventType,
) -> Vec<TaskEvent> {
    let gateway = engine.gateway();
    let mut tx = gateway.begin().await.unwrap();
    let events = gateway
        .list_task_events(&mut tx, tenant, task.key(), event_type, None)
        .await
        .unwrap();
    gateway.rollback(tx).await.unwrap();
    events
}

fn app_failure(task: &Task, non_retryable: bool) -> FailTaskOpts {
    FailTaskOpts {
        task: task.attempt(),
        error_message: "boom".to_string(),
        is_app_error: true,
        is_non_retryable: non_retryable,
    }
}

// ---------------------------------------------------------------------------
// DAG fan-out and fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_completed_parent_queues_children_with_its_output() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(
        &engine,
        tenant,
        vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])],
    )
    .await;

    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({"n": 1}))).await;
    assert!(run.dag.is_some());
    assert_eq!(run.tasks.len(), 1);
    assert_eq!(run.matches.len(), 2);

    let a = &run.tasks[0];
    let assigned = engine
        .assign_tasks(tenant, Uuid::now_v7(), &[a.attempt()])
        .await
        .unwrap();
    assert_eq!(assigned, vec![a.attempt()]);
    complete(&engine, tenant, a, json!({"sum": 3})).await;

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks["a"].status, TaskStatus::Completed);
    for child in ["b", "c"] {
        assert_eq!(tasks[child].status, TaskStatus::Queued);
        let input = task_input(&engine, tenant, &tasks[child]).await;
        assert_eq!(input.input, json!({"n": 1}));
        assert_eq!(input.parents["a"], json!({"sum": 3}));
    }
    assert_eq!(engine.list_queued(tenant, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_child_waits_for_every_parent() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(
        &engine,
        tenant,
        vec![step("a", &[]), step("b", &[]), step("join", &["a", "b"])],
    )
    .await;

    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    assert_eq!(run.tasks.len(), 2);
    let roots: HashMap<&str, &Task> = run
        .tasks
        .iter()
        .map(|t| (t.step_readable_id.as_str(), t))
        .collect();

    complete(&engine, tenant, roots["a"], json!({"from": "a"})).await;
    assert!(!run_tasks(&engine, tenant, run.external_id).await.contains_key("join"));

    complete(&engine, tenant, roots["b"], json!({"from": "b"})).await;
    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    let input = task_input(&engine, tenant, &tasks["join"]).await;
    assert_eq!(input.parents.len(), 2);
    assert_eq!(input.parents["b"], json!({"from": "b"}));
}

#[tokio::test]
async fn test_failed_parent_cancels_children_and_fails_the_run() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(
        &engine,
        tenant,
        vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])],
    )
    .await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    let outcome = engine
        .fail_tasks(tenant, vec![app_failure(&run.tasks[0], false)])
        .await
        .unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.retried.is_empty());

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["b"].status, TaskStatus::Cancelled);
    assert_eq!(tasks["c"].status, TaskStatus::Cancelled);
    assert!(engine.list_queued(tenant, 10).await.unwrap().is_empty());

    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_skipped_output_skips_the_whole_chain() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(
        &engine,
        tenant,
        vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
    )
    .await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    complete(&engine, tenant, &run.tasks[0], json!({"skipped": true})).await;

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["b"].status, TaskStatus::Skipped);
    assert_eq!(tasks["c"].status, TaskStatus::Skipped);

    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].status, RunStatus::Completed);
    assert_eq!(finalized[0].outputs["c"], json!({"skipped": true}));
}

#[tokio::test]
async fn test_cancelled_root_cancels_downstream() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[]), step("b", &["a"])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    let cancelled = engine
        .cancel_tasks(
            tenant,
            vec![CancelTaskOpts {
                task: run.tasks[0].attempt(),
                reason: Some("user request".to_string()),
            }],
        )
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);

    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_on_failure_step_queues_when_a_sibling_fails() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut handler = step("cleanup", &[]);
    handler.job_kind = JobKind::OnFailure;
    let version = put_version(&engine, tenant, vec![step("a", &[]), step("b", &["a"]), handler]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    engine
        .fail_tasks(tenant, vec![app_failure(&run.tasks[0], true)])
        .await
        .unwrap();

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["b"].status, TaskStatus::Cancelled);
    assert_eq!(tasks["cleanup"].status, TaskStatus::Queued);
    assert!(engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap()
        .is_empty());

    complete(&engine, tenant, &tasks["cleanup"], json!({})).await;
    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_on_failure_step_is_skipped_when_everything_succeeds() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut handler = step("cleanup", &[]);
    handler.job_kind = JobKind::OnFailure;
    let version = put_version(&engine, tenant, vec![step("a", &[]), step("b", &["a"]), handler]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    complete(&engine, tenant, &run.tasks[0], json!({})).await;
    let b = run_tasks(&engine, tenant, run.external_id).await["b"].clone();
    complete(&engine, tenant, &b, json!({})).await;

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["cleanup"].status, TaskStatus::Skipped);
    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].status, RunStatus::Completed);
}

// ---------------------------------------------------------------------------
// Release guards and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_and_repeated_releases_are_dropped() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];

    let mut stale = a.attempt();
    stale.retry_count = 4;
    let dropped = engine
        .complete_tasks(tenant, vec![CompleteTaskOpts { task: stale, output: json!({}) }])
        .await
        .unwrap();
    assert!(dropped.is_empty());

    assert_eq!(complete(&engine, tenant, a, json!({"v": 1})).await.len(), 1);
    assert!(complete(&engine, tenant, a, json!({"v": 2})).await.is_empty());
    let failed = engine
        .fail_tasks(tenant, vec![app_failure(a, false)])
        .await
        .unwrap();
    assert!(failed.failed.is_empty() && failed.retried.is_empty());

    let completed = task_events(&engine, tenant, a, TaskEventType::Completed).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].retry_count, 0);
    assert!(task_events(&engine, tenant, a, TaskEventType::Failed).await.is_empty());

    let mut missing = a.attempt();
    missing.id += 1000;
    let err = engine
        .complete_tasks(tenant, vec![CompleteTaskOpts { task: missing, output: json!({}) }])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PartialRelease { expected: 1, released: 0 }));

    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].outputs["a"], json!({"v": 1}));
}

#[tokio::test]
async fn test_app_errors_retry_until_the_policy_is_exhausted() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut a = step("a", &[]);
    a.retries = 1;
    let version = put_version(&engine, tenant, vec![a, step("b", &["a"])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    let first = engine
        .fail_tasks(tenant, vec![app_failure(&run.tasks[0], false)])
        .await
        .unwrap();
    assert_eq!(first.retried.len(), 1);
    assert_eq!(first.retried[0].retry_count, 1);
    assert_eq!(first.retried[0].status, TaskStatus::Queued);
    assert!(!run_tasks(&engine, tenant, run.external_id).await.contains_key("b"));

    let queued = engine.list_queued(tenant, 10).await.unwrap();
    assert_eq!(queued, vec![first.retried[0].attempt()]);

    let second = engine
        .fail_tasks(tenant, vec![app_failure(&first.retried[0], false)])
        .await
        .unwrap();
    assert_eq!(second.failed.len(), 1);
    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["b"].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_non_retryable_errors_skip_the_retry_policy() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut a = step("a", &[]);
    a.retries = 3;
    let version = put_version(&engine, tenant, vec![a]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    let outcome = engine
        .fail_tasks(tenant, vec![app_failure(&run.tasks[0], true)])
        .await
        .unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.retried.is_empty());
}

#[tokio::test]
async fn test_backoff_retries_wait_in_the_retry_queue() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut a = step("a", &[]);
    a.retries = 1;
    a.retry_backoff_factor = Some(2.0);
    let version = put_version(&engine, tenant, vec![a]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    engine
        .fail_tasks(tenant, vec![app_failure(&run.tasks[0], false)])
        .await
        .unwrap();
    assert!(engine.list_queued(tenant, 10).await.unwrap().is_empty());
    assert_eq!(engine.process_task_retry_queue_items(tenant).await.unwrap().processed, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let swept = engine.process_task_retry_queue_items(tenant).await.unwrap();
    assert_eq!(swept.processed, 1);
    assert!(!swept.should_continue);
    assert_eq!(engine.list_queued(tenant, 10).await.unwrap().len(), 1);
}

/// Admits at most `cap` task runs per batch.
struct TaskRunCap {
    cap: usize,
    recorded: AtomicUsize,
}

impl TenantLimiter for TaskRunCap {
    fn check(
        &self,
        tenant: TenantId,
        resource: MeteredResource,
        amount: usize,
    ) -> Result<(), LimitExceeded> {
        if resource == MeteredResource::TaskRun && amount > self.cap {
            return Err(LimitExceeded { tenant, resource });
        }
        Ok(())
    }

    fn record(&self, _tenant: TenantId, resource: MeteredResource, amount: usize) {
        if resource == MeteredResource::TaskRun {
            self.recorded.fetch_add(amount, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_limiter_rejection_rolls_the_batch_back() {
    let limiter = Arc::new(TaskRunCap {
        cap: 1,
        recorded: AtomicUsize::new(0),
    });
    let engine = test_engine(EngineConfig::default())
        .await
        .with_limiter(limiter.clone());
    let tenant = TenantId::new();
    let wide = put_version(&engine, tenant, vec![step("a", &[]), step("b", &[])]).await;
    let narrow = put_version(&engine, tenant, vec![step("a", &[])]).await;

    let rejected = TriggerOpts::new(wide.id, json!({}));
    let run_id = rejected.external_id;
    let err = engine
        .trigger_workflow_runs(tenant, vec![rejected])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceExhausted(_)));
    assert!(run_tasks(&engine, tenant, run_id).await.is_empty());
    assert!(engine.list_queued(tenant, 10).await.unwrap().is_empty());

    let run = trigger(&engine, tenant, TriggerOpts::new(narrow.id, json!({}))).await;
    assert_eq!(run.tasks.len(), 1);
    assert_eq!(engine.list_queued(tenant, 10).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timed_out_attempts_fail() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut a = step("a", &[]);
    a.timeout_secs = 0;
    let version = put_version(&engine, tenant, vec![a]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];
    engine.assign_tasks(tenant, Uuid::now_v7(), &[a.attempt()]).await.unwrap();

    let swept = engine.process_task_timeouts(tenant).await.unwrap();
    assert_eq!(swept.processed, 1);
    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["a"].status, TaskStatus::Failed);
    assert_eq!(engine.process_task_timeouts(tenant).await.unwrap().processed, 0);
}

#[tokio::test]
async fn test_expired_leases_are_retried_internally() {
    let config = EngineConfig {
        lease_secs: 0,
        ..EngineConfig::default()
    };
    let engine = test_engine(config).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];
    engine.assign_tasks(tenant, Uuid::now_v7(), &[a.attempt()]).await.unwrap();
    assert!(engine.list_queued(tenant, 10).await.unwrap().is_empty());

    let swept = engine.process_task_reassignments(tenant).await.unwrap();
    assert_eq!(swept.processed, 1);

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["a"].status, TaskStatus::Queued);
    assert_eq!(tasks["a"].retry_count, 1);
    assert_eq!(tasks["a"].internal_retry_count, 1);
    assert_eq!(engine.list_queued(tenant, 10).await.unwrap(), vec![tasks["a"].attempt()]);
}

#[tokio::test]
async fn test_assigning_twice_only_succeeds_once() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let attempt = run.tasks[0].attempt();

    assert_eq!(engine.assign_tasks(tenant, Uuid::now_v7(), &[attempt]).await.unwrap().len(), 1);
    assert!(engine.assign_tasks(tenant, Uuid::now_v7(), &[attempt]).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// User events, sleeps and durable waits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_user_event_condition_gates_the_step() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut gated = step("ship", &[]);
    gated
        .conditions
        .push(user_condition("order:paid", Uuid::now_v7(), "input.amount > 10"));
    let version = put_version(&engine, tenant, vec![gated]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({"order": 9}))).await;
    assert!(run.tasks.is_empty());
    assert_eq!(run.matches.len(), 1);

    engine
        .process_events(tenant, vec![CandidateEvent::user("order:paid", None, json!({"amount": 5}))])
        .await
        .unwrap();
    assert!(run_tasks(&engine, tenant, run.external_id).await.is_empty());

    engine
        .process_events(tenant, vec![CandidateEvent::user("order:paid", None, json!({"amount": 20}))])
        .await
        .unwrap();
    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    let input = task_input(&engine, tenant, &tasks["ship"]).await;
    assert_eq!(input.input, json!({"order": 9}));
    assert_eq!(input.triggers["order:paid"], vec![json!({"amount": 20})]);
}

#[tokio::test]
async fn test_any_condition_of_an_or_group_satisfies_it() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let group = Uuid::now_v7();
    let mut gated = step("notify", &[]);
    gated.conditions.push(user_condition("sms:ok", group, "true"));
    gated.conditions.push(user_condition("email:ok", group, "true"));
    let version = put_version(&engine, tenant, vec![gated]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    engine
        .process_events(tenant, vec![CandidateEvent::user("email:ok", None, json!({}))])
        .await
        .unwrap();
    assert_eq!(
        run_tasks(&engine, tenant, run.external_id).await["notify"].status,
        TaskStatus::Queued
    );
}

#[tokio::test]
async fn test_failing_expression_leaves_the_condition_unsatisfied() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut gated = step("ship", &[]);
    gated
        .conditions
        .push(user_condition("order:paid", Uuid::now_v7(), "input.amount >"));
    let version = put_version(&engine, tenant, vec![gated]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;

    let written = engine
        .process_events(tenant, vec![CandidateEvent::user("order:paid", None, json!({"amount": 20}))])
        .await
        .unwrap();
    assert!(written.is_empty());
    assert!(run_tasks(&engine, tenant, run.external_id).await.is_empty());
}

#[tokio::test]
async fn test_sleep_condition_fires_after_the_sleep_sweep() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut delayed = step("later", &[]);
    delayed.conditions.push(StepCondition {
        or_group_id: Uuid::now_v7(),
        readable_data_key: "nap".to_string(),
        action: MatchAction::Queue,
        expression: "true".to_string(),
        kind: StepConditionKind::Sleep { sleep_for_secs: 0 },
    });
    let version = put_version(&engine, tenant, vec![delayed]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    assert!(run.tasks.is_empty());

    let swept = engine.process_durable_sleeps(tenant).await.unwrap();
    assert_eq!(swept.processed, 1);
    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    let input = task_input(&engine, tenant, &tasks["later"]).await;
    assert_eq!(input.triggers["nap"][0]["sleep_duration_secs"], json!(0));
    assert_eq!(engine.process_durable_sleeps(tenant).await.unwrap().processed, 0);
}

#[tokio::test]
async fn test_durable_sleep_signals_the_running_task() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];
    engine.assign_tasks(tenant, Uuid::now_v7(), &[a.attempt()]).await.unwrap();

    let first = engine.register_durable_sleep(tenant, a.attempt(), 0).await.unwrap();
    assert_eq!(first.signal_key, "sleep:0");
    assert!(first.created);
    let second = engine.register_durable_sleep(tenant, a.attempt(), 60).await.unwrap();
    assert_eq!(second.signal_key, "sleep:1");

    assert_eq!(engine.process_durable_sleeps(tenant).await.unwrap().processed, 1);

    let gateway = engine.gateway();
    let mut tx = gateway.begin().await.unwrap();
    let completed = gateway
        .list_task_events(&mut tx, tenant, a.key(), TaskEventType::SignalCompleted, None)
        .await
        .unwrap();
    gateway.rollback(tx).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].event_key.as_deref(), Some("sleep:0"));
}

#[tokio::test]
async fn test_durable_wait_is_registered_once_and_completed_by_an_event() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];
    let mut events = engine.subscribe();

    let opts = DurableWaitOpts {
        task: a.attempt(),
        signal_key: None,
        conditions: vec![user_condition("approval", Uuid::now_v7(), "input.ok == true")],
    };
    let wait = engine.register_durable_wait(tenant, opts.clone()).await.unwrap();
    assert!(wait.created);
    let again = engine.register_durable_wait(tenant, opts).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.signal_key, wait.signal_key);

    let written = engine
        .process_events(tenant, vec![CandidateEvent::user("approval", None, json!({"ok": true}))])
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].event_type, TaskEventType::SignalCompleted);
    assert_eq!(written[0].event_key.as_deref(), Some(wait.signal_key.as_str()));

    let created = events.try_recv().unwrap();
    assert_eq!(created.event_type, TaskEventType::SignalCreated);
}

#[tokio::test]
async fn test_retried_attempt_gets_one_signal_per_wait() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut a = step("a", &[]);
    a.retries = 1;
    let version = put_version(&engine, tenant, vec![a]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let first = run.tasks[0].clone();
    let conditions = vec![user_condition("approval", Uuid::now_v7(), "true")];

    let wait = |task: &Task| DurableWaitOpts {
        task: task.attempt(),
        signal_key: Some("k".to_string()),
        conditions: conditions.clone(),
    };
    assert!(engine.register_durable_wait(tenant, wait(&first)).await.unwrap().created);

    let outcome = engine
        .fail_tasks(tenant, vec![app_failure(&first, false)])
        .await
        .unwrap();
    let second = outcome.retried[0].clone();
    assert_eq!(second.retry_count, 1);
    assert!(engine.register_durable_wait(tenant, wait(&second)).await.unwrap().created);

    let written = engine
        .process_events(tenant, vec![CandidateEvent::user("approval", None, json!({}))])
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].retry_count, 1);

    let completed = task_events(&engine, tenant, &second, TaskEventType::SignalCompleted).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].event_key.as_deref(), Some("k"));
}

#[tokio::test]
async fn test_finished_attempt_leaves_no_open_wait() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];

    let opts = DurableWaitOpts {
        task: a.attempt(),
        signal_key: None,
        conditions: vec![user_condition("approval", Uuid::now_v7(), "true")],
    };
    engine.register_durable_wait(tenant, opts).await.unwrap();
    complete(&engine, tenant, a, json!({})).await;

    let (open,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM matches WHERE kind = 'SIGNAL' AND is_satisfied = 0",
    )
    .fetch_one(&engine.gateway().pool().writer)
    .await
    .unwrap();
    assert_eq!(open, 0);

    let written = engine
        .process_events(tenant, vec![CandidateEvent::user("approval", None, json!({}))])
        .await
        .unwrap();
    assert!(written.is_empty());
}

#[tokio::test]
async fn test_sleep_ordinal_ignores_other_waits() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];

    let opts = DurableWaitOpts {
        task: a.attempt(),
        signal_key: Some("approval".to_string()),
        conditions: vec![user_condition("approval", Uuid::now_v7(), "true")],
    };
    engine.register_durable_wait(tenant, opts).await.unwrap();

    let sleep = engine.register_durable_sleep(tenant, a.attempt(), 30).await.unwrap();
    assert_eq!(sleep.signal_key, "sleep:0");
    let next = engine.register_durable_sleep(tenant, a.attempt(), 30).await.unwrap();
    assert_eq!(next.signal_key, "sleep:1");
}

#[tokio::test]
async fn test_durable_wait_on_a_finished_task_is_rejected() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];
    complete(&engine, tenant, a, json!({})).await;

    let err = engine
        .register_durable_sleep(tenant, a.attempt(), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

// ---------------------------------------------------------------------------
// Idempotency and child runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_idempotency_key_is_held_until_the_run_finalizes() {
    let config = EngineConfig {
        idempotency_recheck_interval_secs: 0,
        ..EngineConfig::default()
    };
    let engine = test_engine(config).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let input = json!({"order": 42});
    let key = run_key(&version.workflow_name, &input);

    let mut first = TriggerOpts::new(version.id, input.clone());
    first.idempotency_key = Some(key.clone());
    let run = trigger(&engine, tenant, first.clone()).await;
    assert!(!run.reused);
    assert_eq!(run.tasks.len(), 1);

    let repeat = trigger(&engine, tenant, first).await;
    assert!(repeat.reused);
    assert!(repeat.tasks.is_empty());

    let mut other = TriggerOpts::new(version.id, input.clone());
    other.idempotency_key = Some(key.clone());
    let err = engine
        .trigger_workflow_runs(tenant, vec![other.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyClaimed { claimed_by, .. } if claimed_by == run.external_id));

    complete(&engine, tenant, &run.tasks[0], json!({})).await;
    let next = trigger(&engine, tenant, other).await;
    assert!(!next.reused);
    assert_eq!(next.tasks.len(), 1);
}

#[tokio::test]
async fn test_idempotency_key_is_rejected_within_the_recheck_interval() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let key = run_key("orders", &json!({}));

    let mut first = TriggerOpts::new(version.id, json!({}));
    first.idempotency_key = Some(key.clone());
    let run = trigger(&engine, tenant, first).await;
    complete(&engine, tenant, &run.tasks[0], json!({})).await;

    let mut second = TriggerOpts::new(version.id, json!({}));
    second.idempotency_key = Some(key);
    let err = engine
        .trigger_workflow_runs(tenant, vec![second])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyClaimed { .. }));
}

#[tokio::test]
async fn test_child_run_is_spawned_once_per_parent_slot() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let parent_version = put_version(&engine, tenant, vec![step("parent", &[])]).await;
    let child_version = put_version(&engine, tenant, vec![step("child", &[])]).await;
    let parent_run = trigger(&engine, tenant, TriggerOpts::new(parent_version.id, json!({}))).await;
    let parent = &parent_run.tasks[0];

    let link = ParentLink {
        task: parent.attempt(),
        external_id: parent.external_id,
        child_index: 0,
        child_key: Some("invoice".to_string()),
    };
    let mut spawn = TriggerOpts::new(child_version.id, json!({"invoice": 1}));
    spawn.parent = Some(link.clone());
    let child = trigger(&engine, tenant, spawn).await;
    assert!(!child.reused);
    assert_eq!(child.tasks[0].parent.as_ref(), Some(&link));

    let mut again = TriggerOpts::new(child_version.id, json!({"invoice": 1}));
    again.parent = Some(link);
    let repeat = trigger(&engine, tenant, again).await;
    assert!(repeat.reused);
    assert_eq!(repeat.external_id, child.external_id);
}

// ---------------------------------------------------------------------------
// Replay and finalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_reruns_the_subtree_with_fresh_parent_output() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[]), step("b", &["a"])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({"n": 1}))).await;
    let a = run.tasks[0].clone();

    complete(&engine, tenant, &a, json!({"v": 1})).await;
    let b = run_tasks(&engine, tenant, run.external_id).await["b"].clone();
    complete(&engine, tenant, &b, json!({"done": 1})).await;
    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].outputs.len(), 2);

    let result = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert!(result.acquired);
    assert!(result.discarded.is_empty());
    assert_eq!(result.replayed.len(), 1);
    assert_eq!(result.replayed[0].retry_count, 1);
    assert_eq!(result.deferred, vec![b.key()]);
    assert!(engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap()
        .is_empty());

    // Only the replayed root is dispatchable until it completes again.
    assert_eq!(engine.list_queued(tenant, 10).await.unwrap(), vec![result.replayed[0].attempt()]);
    complete(&engine, tenant, &result.replayed[0], json!({"v": 2})).await;

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["b"].retry_count, 1);
    assert_eq!(tasks["b"].status, TaskStatus::Queued);
    let input = task_input(&engine, tenant, &tasks["b"]).await;
    assert_eq!(input.parents["a"], json!({"v": 2}));
    assert_eq!(input.input, json!({"n": 1}));

    complete(&engine, tenant, &tasks["b"], json!({"done": 2})).await;
    let finalized = engine
        .list_finalized_workflow_runs(tenant, &[run.external_id])
        .await
        .unwrap();
    assert_eq!(finalized[0].status, RunStatus::Completed);
    assert_eq!(finalized[0].outputs["b"], json!({"done": 2}));
}

#[tokio::test]
async fn test_replaying_a_downstream_task_keeps_the_parent_result() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(
        &engine,
        tenant,
        vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
    )
    .await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    complete(&engine, tenant, &run.tasks[0], json!({"a": 1})).await;
    let b = run_tasks(&engine, tenant, run.external_id).await["b"].clone();
    complete(&engine, tenant, &b, json!({"b": 1})).await;
    let c = run_tasks(&engine, tenant, run.external_id).await["c"].clone();
    complete(&engine, tenant, &c, json!({"c": 1})).await;

    let result = engine.replay_tasks(tenant, &[b.key()]).await.unwrap();
    assert_eq!(result.replayed.len(), 1);
    assert_eq!(result.deferred, vec![c.key()]);

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks["a"].status, TaskStatus::Completed);
    assert_eq!(tasks["a"].retry_count, 0);
    assert_eq!(tasks["b"].retry_count, 1);
}

#[tokio::test]
async fn test_replay_of_an_unfinished_run_is_discarded() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[]), step("b", &["a"])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = &run.tasks[0];

    let result = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert!(result.acquired);
    assert!(result.replayed.is_empty());
    assert_eq!(result.discarded, vec![a.key()]);
    assert_eq!(run_tasks(&engine, tenant, run.external_id).await["a"].retry_count, 0);
}

#[tokio::test]
async fn test_replay_of_a_run_with_missing_steps_is_discarded() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let mut gated = step("b", &["a"]);
    gated
        .conditions
        .push(user_condition("order:paid", Uuid::now_v7(), "true"));
    let version = put_version(&engine, tenant, vec![step("a", &[]), gated]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = run.tasks[0].clone();
    complete(&engine, tenant, &a, json!({})).await;

    let tasks = run_tasks(&engine, tenant, run.external_id).await;
    assert_eq!(tasks.len(), 1);
    assert!(tasks["a"].status.is_terminal());

    let result = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert!(result.acquired);
    assert!(result.replayed.is_empty());
    assert_eq!(result.discarded, vec![a.key()]);
    assert_eq!(run_tasks(&engine, tenant, run.external_id).await["a"].retry_count, 0);
}

#[tokio::test]
async fn test_replay_backs_off_from_held_locks() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    let version = put_version(&engine, tenant, vec![step("a", &[])]).await;
    let run = trigger(&engine, tenant, TriggerOpts::new(version.id, json!({}))).await;
    let a = run.tasks[0].clone();
    complete(&engine, tenant, &a, json!({})).await;
    let ttl = Duration::from_secs(60);

    assert!(engine.acquire_lease(tenant, REPLAY_LOCK, "maintenance", ttl).await.unwrap());
    let blocked = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert!(!blocked.acquired);
    assert!(blocked.replayed.is_empty());
    assert!(engine.release_lease(tenant, REPLAY_LOCK, "maintenance").await.unwrap());

    let run_lock = run_lock_name(run.external_id);
    assert!(engine.acquire_lease(tenant, &run_lock, "maintenance", ttl).await.unwrap());
    let locked = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert!(locked.acquired);
    assert!(locked.replayed.is_empty());
    assert_eq!(locked.discarded, vec![a.key()]);
    assert_eq!(run_tasks(&engine, tenant, run.external_id).await["a"].retry_count, 0);

    assert!(engine.release_lease(tenant, &run_lock, "maintenance").await.unwrap());
    let replayed = engine.replay_tasks(tenant, &[a.key()]).await.unwrap();
    assert_eq!(replayed.replayed.len(), 1);
    assert!(engine.acquire_lease(tenant, &run_lock, "other", ttl).await.unwrap());
}

#[tokio::test]
async fn test_tenants_with_versions_are_listed() {
    let engine = test_engine(EngineConfig::default()).await;
    let tenant = TenantId::new();
    put_version(&engine, tenant, vec![step("a", &[])]).await;

    let gateway = engine.gateway();
    let mut tx = gateway.begin().await.unwrap();
    let tenants = gateway.list_tenants(&mut tx).await.unwrap();
    gateway.rollback(tx).await.unwrap();
    assert_eq!(tenants, vec![tenant]);
}
