//! SQLite task repository implementation.
//!
//! Implements `TaskRepository` from `tasklane-core`. Besides the task rows it
//! maintains the scheduling projections: `queue_items` for queued attempts,
//! `task_runtimes` for running ones and `retry_queue_items` for retries
//! waiting out their backoff. An attempt sits in at most one of them.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tasklane_core::repository::TaskRepository;
use tasklane_types::dag::{Dag, DagRef, NewDag};
use tasklane_types::error::RepositoryError;
use tasklane_types::task::{
    DurableSleep, NewTask, ReleasedTask, ReplayTask, ScheduledRetry, Task, TaskAssignment,
    TaskIdInsertedAt, TaskIdInsertedAtRetryCount, TaskStatus, TenantId,
};
use uuid::Uuid;

use super::codec::{
    db_err, format_datetime, from_json, from_opt_json, opt_json, parse_datetime, parse_enum,
    parse_tenant, parse_uuid, stamp, to_json,
};
use super::gateway::{SqliteGateway, SqliteTx};

const TASK_COLUMNS: &str = "id, inserted_at, tenant_id, external_id, workflow_id, \
    workflow_version_id, workflow_run_id, step_id, step_readable_id, action_id, dag_id, \
    dag_inserted_at, dag_external_id, retry_count, internal_retry_count, initial_state, \
    initial_state_reason, status, priority, queue, concurrency_keys, step_expression_values, \
    parent, retry_policy, timeout_secs, additional_metadata";

const DAG_COLUMNS: &str = "id, inserted_at, tenant_id, external_id, workflow_id, \
    workflow_version_id, additional_metadata, total_tasks, parent_task_external_id";

/// Internal row type for mapping SQLite rows to domain Task.
struct TaskRow {
    id: i64,
    inserted_at: String,
    tenant_id: String,
    external_id: String,
    workflow_id: String,
    workflow_version_id: String,
    workflow_run_id: String,
    step_id: String,
    step_readable_id: String,
    action_id: String,
    dag_id: Option<i64>,
    dag_inserted_at: Option<String>,
    dag_external_id: Option<String>,
    retry_count: i32,
    internal_retry_count: i32,
    initial_state: String,
    initial_state_reason: Option<String>,
    status: String,
    priority: i32,
    queue: String,
    concurrency_keys: String,
    step_expression_values: String,
    parent: Option<String>,
    retry_policy: String,
    timeout_secs: i64,
    additional_metadata: Option<String>,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            inserted_at: row.try_get("inserted_at")?,
            tenant_id: row.try_get("tenant_id")?,
            external_id: row.try_get("external_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version_id: row.try_get("workflow_version_id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            step_id: row.try_get("step_id")?,
            step_readable_id: row.try_get("step_readable_id")?,
            action_id: row.try_get("action_id")?,
            dag_id: row.try_get("dag_id")?,
            dag_inserted_at: row.try_get("dag_inserted_at")?,
            dag_external_id: row.try_get("dag_external_id")?,
            retry_count: row.try_get("retry_count")?,
            internal_retry_count: row.try_get("internal_retry_count")?,
            initial_state: row.try_get("initial_state")?,
            initial_state_reason: row.try_get("initial_state_reason")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            queue: row.try_get("queue")?,
            concurrency_keys: row.try_get("concurrency_keys")?,
            step_expression_values: row.try_get("step_expression_values")?,
            parent: row.try_get("parent")?,
            retry_policy: row.try_get("retry_policy")?,
            timeout_secs: row.try_get("timeout_secs")?,
            additional_metadata: row.try_get("additional_metadata")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let dag = match (self.dag_id, self.dag_inserted_at, self.dag_external_id) {
            (Some(id), Some(inserted_at), Some(external_id)) => Some(DagRef {
                id,
                inserted_at: parse_datetime(&inserted_at)?,
                external_id: parse_uuid(&external_id)?,
            }),
            _ => None,
        };

        Ok(Task {
            id: self.id,
            inserted_at: parse_datetime(&self.inserted_at)?,
            tenant_id: parse_tenant(&self.tenant_id)?,
            external_id: parse_uuid(&self.external_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version_id: parse_uuid(&self.workflow_version_id)?,
            workflow_run_id: parse_uuid(&self.workflow_run_id)?,
            step_id: parse_uuid(&self.step_id)?,
            step_readable_id: self.step_readable_id,
            action_id: self.action_id,
            dag,
            retry_count: self.retry_count,
            internal_retry_count: self.internal_retry_count,
            initial_state: parse_enum(&self.initial_state)?,
            initial_state_reason: self.initial_state_reason,
            status: parse_enum(&self.status)?,
            priority: self.priority,
            queue: self.queue,
            concurrency_keys: from_json(&self.concurrency_keys)?,
            step_expression_values: from_json(&self.step_expression_values)?,
            parent: from_opt_json(self.parent.as_deref())?,
            retry_policy: from_json(&self.retry_policy)?,
            timeout_secs: self.timeout_secs,
            additional_metadata: from_opt_json(self.additional_metadata.as_deref())?,
        })
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, RepositoryError> {
    TaskRow::from_row(row).map_err(db_err)?.into_task()
}

fn dag_from_row(row: &SqliteRow) -> Result<Dag, RepositoryError> {
    let inserted_at: String = row.try_get("inserted_at").map_err(db_err)?;
    let tenant_id: String = row.try_get("tenant_id").map_err(db_err)?;
    let external_id: String = row.try_get("external_id").map_err(db_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(db_err)?;
    let workflow_version_id: String = row.try_get("workflow_version_id").map_err(db_err)?;
    let additional_metadata: Option<String> = row.try_get("additional_metadata").map_err(db_err)?;
    let parent_task_external_id: Option<String> =
        row.try_get("parent_task_external_id").map_err(db_err)?;

    Ok(Dag {
        id: row.try_get("id").map_err(db_err)?,
        inserted_at: parse_datetime(&inserted_at)?,
        tenant_id: parse_tenant(&tenant_id)?,
        external_id: parse_uuid(&external_id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        workflow_version_id: parse_uuid(&workflow_version_id)?,
        additional_metadata: from_opt_json(additional_metadata.as_deref())?,
        total_tasks: row.try_get("total_tasks").map_err(db_err)?,
        parent_task_external_id: parent_task_external_id.as_deref().map(parse_uuid).transpose()?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<TaskIdInsertedAtRetryCount, RepositoryError> {
    let inserted_at: String = row.try_get("task_inserted_at").map_err(db_err)?;
    Ok(TaskIdInsertedAtRetryCount {
        id: row.try_get("task_id").map_err(db_err)?,
        inserted_at: parse_datetime(&inserted_at)?,
        retry_count: row.try_get("retry_count").map_err(db_err)?,
    })
}

fn sleep_from_row(row: &SqliteRow) -> Result<DurableSleep, RepositoryError> {
    let tenant_id: String = row.try_get("tenant_id").map_err(db_err)?;
    let sleep_until: String = row.try_get("sleep_until").map_err(db_err)?;
    Ok(DurableSleep {
        id: row.try_get("id").map_err(db_err)?,
        tenant_id: parse_tenant(&tenant_id)?,
        sleep_until: parse_datetime(&sleep_until)?,
        sleep_duration_secs: row.try_get("sleep_duration_secs").map_err(db_err)?,
    })
}

async fn fetch_task(
    conn: &mut SqliteConnection,
    tenant: TenantId,
    id: i64,
) -> Result<Option<Task>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND id = ?"
    ))
    .bind(tenant.to_string())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    row.as_ref().map(task_from_row).transpose()
}

/// Put an attempt on the queue, replacing any stale item for the task.
async fn enqueue(
    conn: &mut SqliteConnection,
    task: &Task,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT OR REPLACE INTO queue_items (task_id, task_inserted_at, tenant_id, retry_count, priority, queue, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id)
    .bind(format_datetime(&task.inserted_at))
    .bind(task.tenant_id.to_string())
    .bind(task.retry_count)
    .bind(task.priority)
    .bind(&task.queue)
    .bind(format_datetime(&now))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Remove the task from every scheduling projection.
async fn clear_projections(
    conn: &mut SqliteConnection,
    tenant: TenantId,
    id: i64,
) -> Result<(), RepositoryError> {
    for table in ["queue_items", "task_runtimes", "retry_queue_items"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE tenant_id = ? AND task_id = ?"))
            .bind(tenant.to_string())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

async fn retire_events(
    conn: &mut SqliteConnection,
    tenant: TenantId,
    id: i64,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "UPDATE task_events SET is_current_retry = 0 WHERE tenant_id = ? AND task_id = ? AND is_current_retry = 1",
    )
    .bind(tenant.to_string())
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn list_attempts(
    conn: &mut SqliteConnection,
    sql: &str,
    tenant: TenantId,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
    let rows = sqlx::query(sql)
        .bind(tenant.to_string())
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    rows.iter().map(attempt_from_row).collect()
}

impl TaskRepository for SqliteGateway {
    async fn insert_dags(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        dags: &[NewDag],
    ) -> Result<Vec<Dag>, RepositoryError> {
        let now = stamp();
        let mut inserted = Vec::with_capacity(dags.len());
        for dag in dags {
            let id = sqlx::query(
                "INSERT INTO dags (inserted_at, tenant_id, external_id, workflow_id, workflow_version_id, additional_metadata, total_tasks, parent_task_external_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format_datetime(&now))
            .bind(tenant.to_string())
            .bind(dag.external_id.to_string())
            .bind(dag.workflow_id.to_string())
            .bind(dag.workflow_version_id.to_string())
            .bind(opt_json(dag.additional_metadata.as_ref())?)
            .bind(dag.total_tasks)
            .bind(dag.parent_task_external_id.map(|id| id.to_string()))
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .last_insert_rowid();

            inserted.push(Dag {
                id,
                inserted_at: now,
                tenant_id: tenant,
                external_id: dag.external_id,
                workflow_id: dag.workflow_id,
                workflow_version_id: dag.workflow_version_id,
                additional_metadata: dag.additional_metadata.clone(),
                total_tasks: dag.total_tasks,
                parent_task_external_id: dag.parent_task_external_id,
            });
        }
        Ok(inserted)
    }

    async fn get_dags_by_external_ids(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        external_ids: &[Uuid],
    ) -> Result<Vec<Dag>, RepositoryError> {
        let mut dags = Vec::new();
        for external_id in external_ids {
            let row = sqlx::query(&format!(
                "SELECT {DAG_COLUMNS} FROM dags WHERE tenant_id = ? AND external_id = ?"
            ))
            .bind(tenant.to_string())
            .bind(external_id.to_string())
            .fetch_optional(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            if let Some(row) = row {
                dags.push(dag_from_row(&row)?);
            }
        }
        Ok(dags)
    }

    async fn ensure_queues(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        names: &[String],
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&stamp());
        for name in names {
            sqlx::query("INSERT OR IGNORE INTO queues (tenant_id, name, created_at) VALUES (?, ?, ?)")
                .bind(tenant.to_string())
                .bind(name)
                .bind(&now)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_tasks(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        tasks: &[NewTask],
    ) -> Result<Vec<Task>, RepositoryError> {
        let now = stamp();
        let mut inserted = Vec::with_capacity(tasks.len());
        for new in tasks {
            let status = TaskStatus::from(new.initial_state);
            let id = sqlx::query(
                "INSERT INTO tasks (inserted_at, tenant_id, external_id, workflow_id, workflow_version_id, workflow_run_id, step_id, step_readable_id, action_id, dag_id, dag_inserted_at, dag_external_id, retry_count, internal_retry_count, initial_state, initial_state_reason, status, priority, queue, concurrency_keys, step_expression_values, parent, retry_policy, timeout_secs, additional_metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format_datetime(&now))
            .bind(tenant.to_string())
            .bind(new.external_id.to_string())
            .bind(new.workflow_id.to_string())
            .bind(new.workflow_version_id.to_string())
            .bind(new.workflow_run_id.to_string())
            .bind(new.step_id.to_string())
            .bind(&new.step_readable_id)
            .bind(&new.action_id)
            .bind(new.dag.map(|d| d.id))
            .bind(new.dag.map(|d| format_datetime(&d.inserted_at)))
            .bind(new.dag.map(|d| d.external_id.to_string()))
            .bind(new.initial_state.as_str())
            .bind(&new.initial_state_reason)
            .bind(status.as_str())
            .bind(new.priority)
            .bind(&new.queue)
            .bind(to_json(&new.concurrency_keys)?)
            .bind(to_json(&new.step_expression_values)?)
            .bind(opt_json(new.parent.as_ref())?)
            .bind(to_json(&new.retry_policy)?)
            .bind(new.timeout_secs)
            .bind(opt_json(new.additional_metadata.as_ref())?)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .last_insert_rowid();

            let task = Task {
                id,
                inserted_at: now,
                tenant_id: tenant,
                external_id: new.external_id,
                workflow_id: new.workflow_id,
                workflow_version_id: new.workflow_version_id,
                workflow_run_id: new.workflow_run_id,
                step_id: new.step_id,
                step_readable_id: new.step_readable_id.clone(),
                action_id: new.action_id.clone(),
                dag: new.dag,
                retry_count: 0,
                internal_retry_count: 0,
                initial_state: new.initial_state,
                initial_state_reason: new.initial_state_reason.clone(),
                status,
                priority: new.priority,
                queue: new.queue.clone(),
                concurrency_keys: new.concurrency_keys.clone(),
                step_expression_values: new.step_expression_values.clone(),
                parent: new.parent.clone(),
                retry_policy: new.retry_policy.clone(),
                timeout_secs: new.timeout_secs,
                additional_metadata: new.additional_metadata.clone(),
            };
            if status == TaskStatus::Queued {
                enqueue(&mut tx.conn, &task, now).await?;
            }
            inserted.push(task);
        }
        Ok(inserted)
    }

    async fn replay_tasks(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        tasks: &[ReplayTask],
    ) -> Result<Vec<Task>, RepositoryError> {
        let now = stamp();
        let mut replayed = Vec::with_capacity(tasks.len());
        for replay in tasks {
            let status = TaskStatus::from(replay.initial_state);
            let updated = sqlx::query(
                "UPDATE tasks SET retry_count = retry_count + 1, internal_retry_count = 0, initial_state = ?, initial_state_reason = ?, status = ?, concurrency_keys = ?, step_expression_values = ?
                 WHERE tenant_id = ? AND id = ?",
            )
            .bind(replay.initial_state.as_str())
            .bind(&replay.initial_state_reason)
            .bind(status.as_str())
            .bind(to_json(&replay.concurrency_keys)?)
            .bind(to_json(&replay.step_expression_values)?)
            .bind(tenant.to_string())
            .bind(replay.task.id)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 0 {
                tracing::warn!(task_id = replay.task.id, "replayed task does not exist");
                continue;
            }

            clear_projections(&mut tx.conn, tenant, replay.task.id).await?;
            retire_events(&mut tx.conn, tenant, replay.task.id).await?;
            let Some(task) = fetch_task(&mut tx.conn, tenant, replay.task.id).await? else {
                continue;
            };
            if task.status == TaskStatus::Queued {
                enqueue(&mut tx.conn, &task, now).await?;
            }
            replayed.push(task);
        }
        Ok(replayed)
    }

    async fn reset_for_replay(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        tasks: &[TaskIdInsertedAt],
    ) -> Result<(), RepositoryError> {
        for key in tasks {
            sqlx::query("UPDATE tasks SET status = 'QUEUED' WHERE tenant_id = ? AND id = ?")
                .bind(tenant.to_string())
                .bind(key.id)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?;
            clear_projections(&mut tx.conn, tenant, key.id).await?;
            retire_events(&mut tx.conn, tenant, key.id).await?;
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        keys: &[TaskIdInsertedAt],
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(task) = fetch_task(&mut tx.conn, tenant, key.id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn get_tasks_by_external_ids(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        external_ids: &[Uuid],
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks = Vec::with_capacity(external_ids.len());
        for external_id in external_ids {
            let row = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND external_id = ?"
            ))
            .bind(tenant.to_string())
            .bind(external_id.to_string())
            .fetch_optional(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            if let Some(row) = row {
                tasks.push(task_from_row(&row)?);
            }
        }
        Ok(tasks)
    }

    async fn list_tasks_for_runs(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        workflow_run_ids: &[Uuid],
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks = Vec::new();
        for run_id in workflow_run_ids {
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND workflow_run_id = ? ORDER BY id"
            ))
            .bind(tenant.to_string())
            .bind(run_id.to_string())
            .fetch_all(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            for row in &rows {
                tasks.push(task_from_row(row)?);
            }
        }
        Ok(tasks)
    }

    async fn release_tasks(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        attempts: &[TaskIdInsertedAtRetryCount],
        status: TaskStatus,
    ) -> Result<Vec<Option<ReleasedTask>>, RepositoryError> {
        let mut results = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            let Some(mut task) = fetch_task(&mut tx.conn, tenant, attempt.id).await? else {
                results.push(None);
                continue;
            };
            if task.status.is_terminal() || task.retry_count != attempt.retry_count {
                results.push(Some(ReleasedTask {
                    task,
                    released: false,
                }));
                continue;
            }

            sqlx::query("UPDATE tasks SET status = ? WHERE tenant_id = ? AND id = ? AND retry_count = ?")
                .bind(status.as_str())
                .bind(tenant.to_string())
                .bind(attempt.id)
                .bind(attempt.retry_count)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?;
            clear_projections(&mut tx.conn, tenant, attempt.id).await?;
            task.status = status;
            results.push(Some(ReleasedTask {
                task,
                released: true,
            }));
        }
        Ok(results)
    }

    async fn schedule_retries(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        retries: &[ScheduledRetry],
    ) -> Result<Vec<Task>, RepositoryError> {
        let now = stamp();
        let mut scheduled = Vec::with_capacity(retries.len());
        for retry in retries {
            let updated = sqlx::query(
                "UPDATE tasks SET retry_count = retry_count + 1, internal_retry_count = internal_retry_count + ?, status = 'QUEUED'
                 WHERE tenant_id = ? AND id = ? AND retry_count = ?",
            )
            .bind(i32::from(retry.is_internal))
            .bind(tenant.to_string())
            .bind(retry.task.id)
            .bind(retry.task.retry_count)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 0 {
                continue;
            }
            let Some(task) = fetch_task(&mut tx.conn, tenant, retry.task.id).await? else {
                continue;
            };

            match retry.retry_after {
                Some(retry_after) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO retry_queue_items (task_id, task_inserted_at, tenant_id, retry_count, retry_after)
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(task.id)
                    .bind(format_datetime(&task.inserted_at))
                    .bind(tenant.to_string())
                    .bind(task.retry_count)
                    .bind(format_datetime(&retry_after))
                    .execute(&mut *tx.conn)
                    .await
                    .map_err(db_err)?;
                }
                None => enqueue(&mut tx.conn, &task, now).await?,
            }
            scheduled.push(task);
        }
        Ok(scheduled)
    }

    async fn assign_tasks(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        assignments: &[TaskAssignment],
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
        let mut assigned = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let attempt = assignment.task;
            // Only an attempt still holding its queue item can be assigned.
            let updated = sqlx::query(
                "UPDATE tasks SET status = 'RUNNING'
                 WHERE tenant_id = ? AND id = ? AND retry_count = ? AND status = 'QUEUED'
                   AND EXISTS (SELECT 1 FROM queue_items q WHERE q.task_id = tasks.id AND q.retry_count = tasks.retry_count)",
            )
            .bind(tenant.to_string())
            .bind(attempt.id)
            .bind(attempt.retry_count)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 0 {
                continue;
            }

            clear_projections(&mut tx.conn, tenant, attempt.id).await?;
            sqlx::query(
                "INSERT INTO task_runtimes (task_id, task_inserted_at, tenant_id, retry_count, worker_id, timeout_at, lease_expires_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(attempt.id)
            .bind(format_datetime(&attempt.inserted_at))
            .bind(tenant.to_string())
            .bind(attempt.retry_count)
            .bind(assignment.worker_id.to_string())
            .bind(format_datetime(&assignment.timeout_at))
            .bind(format_datetime(&assignment.lease_expires_at))
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            assigned.push(attempt);
        }
        Ok(assigned)
    }

    async fn list_queued(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        limit: i64,
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT task_id, task_inserted_at, retry_count FROM queue_items
             WHERE tenant_id = ? ORDER BY priority DESC, enqueued_at, task_id LIMIT ?",
        )
        .bind(tenant.to_string())
        .bind(limit)
        .fetch_all(&mut *tx.conn)
        .await
        .map_err(db_err)?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn list_timed_out(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
        list_attempts(
            &mut tx.conn,
            "SELECT task_id, task_inserted_at, retry_count FROM task_runtimes
             WHERE tenant_id = ? AND timeout_at <= ? ORDER BY timeout_at, task_id LIMIT ?",
            tenant,
            now,
            limit,
        )
        .await
    }

    async fn list_expired_leases(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
        list_attempts(
            &mut tx.conn,
            "SELECT task_id, task_inserted_at, retry_count FROM task_runtimes
             WHERE tenant_id = ? AND lease_expires_at <= ? ORDER BY lease_expires_at, task_id LIMIT ?",
            tenant,
            now,
            limit,
        )
        .await
    }

    async fn requeue_ready_retries(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, RepositoryError> {
        let ready = list_attempts(
            &mut tx.conn,
            "SELECT task_id, task_inserted_at, retry_count FROM retry_queue_items
             WHERE tenant_id = ? AND retry_after <= ? ORDER BY retry_after, task_id LIMIT ?",
            tenant,
            now,
            limit,
        )
        .await?;

        let mut requeued = Vec::with_capacity(ready.len());
        for attempt in ready {
            sqlx::query("DELETE FROM retry_queue_items WHERE tenant_id = ? AND task_id = ?")
                .bind(tenant.to_string())
                .bind(attempt.id)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?;
            let Some(task) = fetch_task(&mut tx.conn, tenant, attempt.id).await? else {
                continue;
            };
            if task.retry_count != attempt.retry_count || task.status != TaskStatus::Queued {
                tracing::debug!(task_id = attempt.id, "dropping stale retry queue item");
                continue;
            }
            enqueue(&mut tx.conn, &task, now).await?;
            requeued.push(attempt);
        }
        Ok(requeued)
    }

    async fn insert_durable_sleeps(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        durations_secs: &[i64],
    ) -> Result<Vec<DurableSleep>, RepositoryError> {
        let now = stamp();
        let mut sleeps = Vec::with_capacity(durations_secs.len());
        for secs in durations_secs {
            let sleep_until = now + Duration::seconds(*secs);
            let id = sqlx::query(
                "INSERT INTO durable_sleeps (tenant_id, sleep_until, sleep_duration_secs) VALUES (?, ?, ?)",
            )
            .bind(tenant.to_string())
            .bind(format_datetime(&sleep_until))
            .bind(secs)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .last_insert_rowid();
            sleeps.push(DurableSleep {
                id,
                tenant_id: tenant,
                sleep_until,
                sleep_duration_secs: *secs,
            });
        }
        Ok(sleeps)
    }

    async fn pop_expired_sleeps(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DurableSleep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, sleep_until, sleep_duration_secs FROM durable_sleeps
             WHERE tenant_id = ? AND sleep_until <= ? ORDER BY sleep_until, id LIMIT ?",
        )
        .bind(tenant.to_string())
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&mut *tx.conn)
        .await
        .map_err(db_err)?;
        let sleeps = rows
            .iter()
            .map(sleep_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        for sleep in &sleeps {
            sqlx::query("DELETE FROM durable_sleeps WHERE id = ?")
                .bind(sleep.id)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?;
        }
        Ok(sleeps)
    }
}
