//! SQLite match repository implementation.
//!
//! A match row carries its target as JSON; its conditions live in
//! `match_conditions` and are looked up by `(event_type, event_key)`.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tasklane_core::repository::MatchRepository;
use tasklane_core::repository::matching::{ClosedMatch, ConditionLookup, SatisfiedCondition};
use tasklane_types::error::RepositoryError;
use tasklane_types::matching::{GroupMatchCondition, Match, MatchTarget, NewMatch};
use tasklane_types::task::{TaskIdInsertedAtRetryCount, TenantId};

use super::codec::{
    db_err, format_datetime, from_json, from_opt_json, opt_json, parse_enum, parse_tenant,
    parse_uuid, stamp, to_json,
};
use super::gateway::{SqliteGateway, SqliteTx};

const CONDITION_COLUMNS: &str = "c.id AS id, c.match_id AS match_id, c.group_id AS group_id, \
    c.event_type AS event_type, c.event_key AS event_key, \
    c.event_resource_hint AS event_resource_hint, c.expression AS expression, \
    c.action AS action, c.readable_data_key AS readable_data_key, \
    c.is_satisfied AS is_satisfied, c.data AS data";

fn condition_from_row(row: &SqliteRow) -> Result<GroupMatchCondition, RepositoryError> {
    let group_id: String = row.try_get("group_id").map_err(db_err)?;
    let event_type: String = row.try_get("event_type").map_err(db_err)?;
    let action: String = row.try_get("action").map_err(db_err)?;
    let data: Option<String> = row.try_get("data").map_err(db_err)?;

    Ok(GroupMatchCondition {
        id: row.try_get("id").map_err(db_err)?,
        match_id: row.try_get("match_id").map_err(db_err)?,
        group_id: parse_uuid(&group_id)?,
        event_type: parse_enum(&event_type)?,
        event_key: row.try_get("event_key").map_err(db_err)?,
        event_resource_hint: row.try_get("event_resource_hint").map_err(db_err)?,
        expression: row.try_get("expression").map_err(db_err)?,
        action: parse_enum(&action)?,
        readable_data_key: row.try_get("readable_data_key").map_err(db_err)?,
        is_satisfied: row.try_get("is_satisfied").map_err(db_err)?,
        data: from_opt_json(data.as_deref())?,
    })
}

async fn fetch_match(
    conn: &mut SqliteConnection,
    tenant: TenantId,
    id: i64,
) -> Result<Option<Match>, RepositoryError> {
    let Some(row) = sqlx::query(
        "SELECT id, tenant_id, kind, is_satisfied, target, aggregated_data FROM matches
         WHERE tenant_id = ? AND id = ?",
    )
    .bind(tenant.to_string())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    else {
        return Ok(None);
    };

    let tenant_id: String = row.try_get("tenant_id").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let target: String = row.try_get("target").map_err(db_err)?;
    let aggregated_data: Option<String> = row.try_get("aggregated_data").map_err(db_err)?;

    let condition_rows = sqlx::query(&format!(
        "SELECT {CONDITION_COLUMNS} FROM match_conditions c WHERE c.match_id = ? ORDER BY c.id"
    ))
    .bind(id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    let conditions = condition_rows
        .iter()
        .map(condition_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Match {
        id: row.try_get("id").map_err(db_err)?,
        tenant_id: parse_tenant(&tenant_id)?,
        kind: parse_enum(&kind)?,
        is_satisfied: row.try_get("is_satisfied").map_err(db_err)?,
        target: from_json::<MatchTarget>(&target)?,
        aggregated_data: from_opt_json(aggregated_data.as_deref())?,
        conditions,
    }))
}

impl MatchRepository for SqliteGateway {
    async fn insert_matches(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>, RepositoryError> {
        let now = format_datetime(&stamp());
        let mut inserted = Vec::with_capacity(matches.len());
        for new in matches {
            let kind = new.target.kind();
            let attempt = new.target.signal_attempt();
            let match_id = sqlx::query(
                "INSERT INTO matches (tenant_id, kind, is_satisfied, target, aggregated_data, signal_task_id, signal_retry_count, created_at)
                 VALUES (?, ?, 0, ?, NULL, ?, ?, ?)",
            )
            .bind(tenant.to_string())
            .bind(kind.as_str())
            .bind(to_json(&new.target)?)
            .bind(attempt.map(|a| a.id))
            .bind(attempt.map(|a| a.retry_count))
            .bind(&now)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .last_insert_rowid();

            let mut conditions = Vec::with_capacity(new.conditions.len());
            for condition in &new.conditions {
                let is_satisfied = condition.satisfied_data.is_some();
                let id = sqlx::query(
                    "INSERT INTO match_conditions (tenant_id, match_id, group_id, event_type, event_key, event_resource_hint, expression, action, readable_data_key, is_satisfied, data)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(tenant.to_string())
                .bind(match_id)
                .bind(condition.group_id.to_string())
                .bind(condition.event_type.as_str())
                .bind(&condition.event_key)
                .bind(&condition.event_resource_hint)
                .bind(&condition.expression)
                .bind(condition.action.as_str())
                .bind(&condition.readable_data_key)
                .bind(is_satisfied)
                .bind(opt_json(condition.satisfied_data.as_ref())?)
                .execute(&mut *tx.conn)
                .await
                .map_err(db_err)?
                .last_insert_rowid();

                conditions.push(GroupMatchCondition {
                    id,
                    match_id,
                    group_id: condition.group_id,
                    event_type: condition.event_type,
                    event_key: condition.event_key.clone(),
                    event_resource_hint: condition.event_resource_hint.clone(),
                    expression: condition.expression.clone(),
                    action: condition.action,
                    readable_data_key: condition.readable_data_key.clone(),
                    is_satisfied,
                    data: condition.satisfied_data.clone(),
                });
            }

            inserted.push(Match {
                id: match_id,
                tenant_id: tenant,
                kind,
                is_satisfied: false,
                target: new.target.clone(),
                aggregated_data: None,
                conditions,
            });
        }
        Ok(inserted)
    }

    async fn list_candidate_conditions(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        lookups: &[ConditionLookup],
    ) -> Result<Vec<GroupMatchCondition>, RepositoryError> {
        let mut found: BTreeMap<i64, GroupMatchCondition> = BTreeMap::new();
        for lookup in lookups {
            let base = format!(
                "SELECT {CONDITION_COLUMNS} FROM match_conditions c
                 JOIN matches m ON m.id = c.match_id
                 WHERE c.tenant_id = ? AND c.event_type = ? AND c.event_key = ?
                   AND c.is_satisfied = 0 AND m.is_satisfied = 0"
            );
            let rows = match &lookup.resource_hint {
                Some(hint) => {
                    sqlx::query(&format!(
                        "{base} AND (c.event_resource_hint IS NULL OR c.event_resource_hint = ?)"
                    ))
                    .bind(tenant.to_string())
                    .bind(lookup.event_type.as_str())
                    .bind(&lookup.event_key)
                    .bind(hint)
                    .fetch_all(&mut *tx.conn)
                    .await
                }
                None => {
                    sqlx::query(&format!("{base} AND c.event_resource_hint IS NULL"))
                        .bind(tenant.to_string())
                        .bind(lookup.event_type.as_str())
                        .bind(&lookup.event_key)
                        .fetch_all(&mut *tx.conn)
                        .await
                }
            }
            .map_err(db_err)?;
            for row in &rows {
                let condition = condition_from_row(row)?;
                found.insert(condition.id, condition);
            }
        }
        Ok(found.into_values().collect())
    }

    async fn satisfy_conditions(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        conditions: &[SatisfiedCondition],
    ) -> Result<(), RepositoryError> {
        for condition in conditions {
            sqlx::query(
                "UPDATE match_conditions SET is_satisfied = 1, data = ?
                 WHERE tenant_id = ? AND id = ? AND is_satisfied = 0",
            )
            .bind(to_json(&condition.data)?)
            .bind(tenant.to_string())
            .bind(condition.id)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_matches(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        ids: &[i64],
    ) -> Result<Vec<Match>, RepositoryError> {
        let mut matches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(found) = fetch_match(&mut tx.conn, tenant, *id).await? {
                matches.push(found);
            }
        }
        Ok(matches)
    }

    async fn close_matches(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        matches: &[ClosedMatch],
    ) -> Result<Vec<i64>, RepositoryError> {
        let mut closed = Vec::with_capacity(matches.len());
        for closing in matches {
            let updated = sqlx::query(
                "UPDATE matches SET is_satisfied = 1, aggregated_data = ?
                 WHERE tenant_id = ? AND id = ? AND is_satisfied = 0",
            )
            .bind(to_json::<Value>(&closing.aggregated_data)?)
            .bind(tenant.to_string())
            .bind(closing.id)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated > 0 {
                closed.push(closing.id);
            }
        }
        Ok(closed)
    }

    async fn delete_signal_matches(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        attempts: &[TaskIdInsertedAtRetryCount],
    ) -> Result<u64, RepositoryError> {
        let mut deleted = 0;
        for attempt in attempts {
            sqlx::query(
                "DELETE FROM match_conditions WHERE match_id IN (
                    SELECT id FROM matches
                    WHERE tenant_id = ? AND kind = 'SIGNAL' AND is_satisfied = 0
                      AND signal_task_id = ? AND signal_retry_count = ?)",
            )
            .bind(tenant.to_string())
            .bind(attempt.id)
            .bind(attempt.retry_count)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?;

            deleted += sqlx::query(
                "DELETE FROM matches
                 WHERE tenant_id = ? AND kind = 'SIGNAL' AND is_satisfied = 0
                   AND signal_task_id = ? AND signal_retry_count = ?",
            )
            .bind(tenant.to_string())
            .bind(attempt.id)
            .bind(attempt.retry_count)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
        }
        Ok(deleted)
    }
}
