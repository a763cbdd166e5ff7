//! Task repository trait definition.
//!
//! Covers the task rows and the projections the state machine owns: DAG rows,
//! queues, queue items, runtimes (assigned attempts), retry-queue items and
//! durable sleeps.

use chrono::{DateTime, Utc};
use tasklane_types::dag::{Dag, NewDag};
use tasklane_types::error::RepositoryError;
use tasklane_types::task::{
    DurableSleep, NewTask, ReleasedTask, ReplayTask, ScheduledRetry, Task, TaskAssignment,
    TaskIdInsertedAt, TaskIdInsertedAtRetryCount, TaskStatus, TenantId,
};
use uuid::Uuid;

use super::Transactional;

/// Repository trait for task persistence.
///
/// Batch methods return results in input order unless stated otherwise.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskRepository: Transactional {
    // -----------------------------------------------------------------------
    // DAGs and queues
    // -----------------------------------------------------------------------

    fn insert_dags(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        dags: &[NewDag],
    ) -> impl std::future::Future<Output = Result<Vec<Dag>, RepositoryError>> + Send;

    fn get_dags_by_external_ids(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        external_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Dag>, RepositoryError>> + Send;

    /// Create any queues in `names` that do not exist yet.
    fn ensure_queues(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        names: &[String],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert tasks at `retry_count = 0`. Tasks created `QUEUED` also get a
    /// queue item.
    fn insert_tasks(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        tasks: &[NewTask],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Replay tasks in place: bump `retry_count`, reset `internal_retry_count`,
    /// apply the new initial state and drop any runtime. `QUEUED` replays get
    /// a queue item.
    fn replay_tasks(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        tasks: &[ReplayTask],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Mark tasks that will be replayed once their match fires: status goes
    /// back to `QUEUED` (without a queue item) and their events stop being
    /// current.
    fn reset_for_replay(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        tasks: &[TaskIdInsertedAt],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch tasks by key. Missing tasks are omitted.
    fn get_tasks(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        keys: &[TaskIdInsertedAt],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    fn get_tasks_by_external_ids(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        external_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Every task belonging to the given workflow runs.
    fn list_tasks_for_runs(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        workflow_run_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Release attempts into a terminal status.
    ///
    /// Only a non-terminal task whose `retry_count` matches is released. The
    /// result is aligned with the input: `None` when the task row does not
    /// exist, otherwise the row with `released` telling whether this call
    /// changed it. Runtimes and queue items of released attempts are removed.
    fn release_tasks(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        attempts: &[TaskIdInsertedAtRetryCount],
        status: TaskStatus,
    ) -> impl std::future::Future<Output = Result<Vec<Option<ReleasedTask>>, RepositoryError>> + Send;

    /// Start the next attempt of failed tasks. Retries with `retry_after`
    /// wait in the retry queue; the rest are queued immediately.
    fn schedule_retries(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        retries: &[ScheduledRetry],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Scheduling projections
    // -----------------------------------------------------------------------

    /// Move queued attempts to `RUNNING`. Returns the attempts that were
    /// still queued at the given retry count.
    fn assign_tasks(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        assignments: &[TaskAssignment],
    ) -> impl std::future::Future<Output = Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError>> + Send;

    /// Queue items in priority order (highest first, then oldest).
    fn list_queued(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError>> + Send;

    /// Running attempts whose timeout deadline has passed.
    fn list_timed_out(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError>> + Send;

    /// Running attempts whose worker lease has expired.
    fn list_expired_leases(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError>> + Send;

    /// Move retry-queue items whose `retry_after` has passed onto the queue.
    fn requeue_ready_retries(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Durable sleeps
    // -----------------------------------------------------------------------

    /// Register one sleep per duration (seconds), starting now.
    fn insert_durable_sleeps(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        durations_secs: &[i64],
    ) -> impl std::future::Future<Output = Result<Vec<DurableSleep>, RepositoryError>> + Send;

    /// Delete and return sleeps that expired at or before `now`.
    fn pop_expired_sleeps(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<DurableSleep>, RepositoryError>> + Send;
}
