//! Task event repository trait definition.

use tasklane_types::error::RepositoryError;
use tasklane_types::event::{NewTaskEvent, TaskEvent, TaskEventType};
use tasklane_types::task::{TaskIdInsertedAt, TenantId};

use super::Transactional;

/// Append-only storage for task events. Event data goes to the payload store.
pub trait TaskEventRepository: Transactional {
    /// Append events. Returned in input order.
    fn insert_events(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        events: &[NewTaskEvent],
    ) -> impl std::future::Future<Output = Result<Vec<TaskEvent>, RepositoryError>> + Send;

    /// Events of one task with the given type and, when set, key.
    fn list_task_events(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        task: TaskIdInsertedAt,
        event_type: TaskEventType,
        event_key: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<TaskEvent>, RepositoryError>> + Send;

    /// Terminal events of the current attempt of each task: marked current and
    /// written at the task's present `retry_count`.
    fn list_current_terminal_events(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        tasks: &[TaskIdInsertedAt],
    ) -> impl std::future::Future<Output = Result<Vec<TaskEvent>, RepositoryError>> + Send;
}
