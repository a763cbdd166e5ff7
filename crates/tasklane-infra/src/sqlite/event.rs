//! SQLite task event repository implementation.

use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tasklane_core::repository::TaskEventRepository;
use tasklane_types::error::RepositoryError;
use tasklane_types::event::{NewTaskEvent, TaskEvent, TaskEventType};
use tasklane_types::task::{TaskIdInsertedAt, TenantId};

use super::codec::{db_err, format_datetime, parse_datetime, parse_enum, parse_tenant, parse_uuid, stamp};
use super::gateway::{SqliteGateway, SqliteTx};

const EVENT_COLUMNS: &str = "e.id AS id, e.inserted_at AS inserted_at, e.tenant_id AS tenant_id, \
    e.task_id AS task_id, e.task_inserted_at AS task_inserted_at, \
    e.task_external_id AS task_external_id, e.retry_count AS retry_count, \
    e.event_type AS event_type, e.event_key AS event_key, e.is_current_retry AS is_current_retry";

fn event_from_row(row: &SqliteRow) -> Result<TaskEvent, RepositoryError> {
    let inserted_at: String = row.try_get("inserted_at").map_err(db_err)?;
    let tenant_id: String = row.try_get("tenant_id").map_err(db_err)?;
    let task_inserted_at: String = row.try_get("task_inserted_at").map_err(db_err)?;
    let task_external_id: String = row.try_get("task_external_id").map_err(db_err)?;
    let event_type: String = row.try_get("event_type").map_err(db_err)?;

    Ok(TaskEvent {
        id: row.try_get("id").map_err(db_err)?,
        inserted_at: parse_datetime(&inserted_at)?,
        tenant_id: parse_tenant(&tenant_id)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        task_inserted_at: parse_datetime(&task_inserted_at)?,
        task_external_id: parse_uuid(&task_external_id)?,
        retry_count: row.try_get("retry_count").map_err(db_err)?,
        event_type: parse_enum(&event_type)?,
        event_key: row.try_get("event_key").map_err(db_err)?,
        is_current_retry: row.try_get("is_current_retry").map_err(db_err)?,
    })
}

impl TaskEventRepository for SqliteGateway {
    async fn insert_events(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        events: &[NewTaskEvent],
    ) -> Result<Vec<TaskEvent>, RepositoryError> {
        let now = stamp();
        let mut inserted = Vec::with_capacity(events.len());
        for event in events {
            let id = sqlx::query(
                "INSERT INTO task_events (inserted_at, tenant_id, task_id, task_inserted_at, task_external_id, retry_count, event_type, event_key, is_current_retry)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format_datetime(&now))
            .bind(tenant.to_string())
            .bind(event.task.id)
            .bind(format_datetime(&event.task.inserted_at))
            .bind(event.task_external_id.to_string())
            .bind(event.task.retry_count)
            .bind(event.event_type.as_str())
            .bind(&event.event_key)
            .bind(event.is_current_retry)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .last_insert_rowid();

            inserted.push(TaskEvent {
                id,
                inserted_at: now,
                tenant_id: tenant,
                task_id: event.task.id,
                task_inserted_at: event.task.inserted_at,
                task_external_id: event.task_external_id,
                retry_count: event.task.retry_count,
                event_type: event.event_type,
                event_key: event.event_key.clone(),
                is_current_retry: event.is_current_retry,
            });
        }
        Ok(inserted)
    }

    async fn list_task_events(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        task: TaskIdInsertedAt,
        event_type: TaskEventType,
        event_key: Option<&str>,
    ) -> Result<Vec<TaskEvent>, RepositoryError> {
        let rows = match event_key {
            Some(key) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM task_events e
                     WHERE e.tenant_id = ? AND e.task_id = ? AND e.event_type = ? AND e.event_key = ?
                     ORDER BY e.id"
                ))
                .bind(tenant.to_string())
                .bind(task.id)
                .bind(event_type.as_str())
                .bind(key)
                .fetch_all(&mut *tx.conn)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM task_events e
                     WHERE e.tenant_id = ? AND e.task_id = ? AND e.event_type = ?
                     ORDER BY e.id"
                ))
                .bind(tenant.to_string())
                .bind(task.id)
                .bind(event_type.as_str())
                .fetch_all(&mut *tx.conn)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn list_current_terminal_events(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        tasks: &[TaskIdInsertedAt],
    ) -> Result<Vec<TaskEvent>, RepositoryError> {
        let mut events = Vec::new();
        for task in tasks {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM task_events e
                 JOIN tasks t ON t.id = e.task_id AND t.retry_count = e.retry_count
                 WHERE e.tenant_id = ? AND e.task_id = ? AND e.is_current_retry = 1
                   AND e.event_type IN ('COMPLETED', 'FAILED', 'CANCELLED')
                 ORDER BY e.id"
            ))
            .bind(tenant.to_string())
            .bind(task.id)
            .fetch_all(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            for row in &rows {
                events.push(event_from_row(row)?);
            }
        }
        Ok(events)
    }
}
