//! SQLite workflow repository implementation.
//!
//! Workflow versions are stored whole, steps as a JSON array. Idempotency
//! claims are keyed by `(tenant, key)`.

use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tasklane_core::repository::WorkflowRepository;
use tasklane_types::error::RepositoryError;
use tasklane_types::idempotency::{IdempotencyClaim, IdempotencyKey};
use tasklane_types::task::TenantId;
use tasklane_types::workflow::WorkflowVersion;
use uuid::Uuid;

use super::codec::{db_err, format_datetime, from_json, parse_datetime, parse_tenant, parse_uuid, stamp, to_json};
use super::gateway::{SqliteGateway, SqliteTx};

fn version_from_row(row: &SqliteRow) -> Result<WorkflowVersion, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(db_err)?;
    let steps: String = row.try_get("steps").map_err(db_err)?;
    Ok(WorkflowVersion {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        workflow_name: row.try_get("workflow_name").map_err(db_err)?,
        steps: from_json(&steps)?,
    })
}

fn claim_from_row(row: &SqliteRow) -> Result<IdempotencyClaim, RepositoryError> {
    let tenant_id: String = row.try_get("tenant_id").map_err(db_err)?;
    let key: String = row.try_get("key").map_err(db_err)?;
    let claimed_by: String = row.try_get("claimed_by").map_err(db_err)?;
    let claimed_at: String = row.try_get("claimed_at").map_err(db_err)?;
    let last_checked_at: String = row.try_get("last_checked_at").map_err(db_err)?;
    Ok(IdempotencyClaim {
        tenant_id: parse_tenant(&tenant_id)?,
        key: IdempotencyKey(key),
        claimed_by: parse_uuid(&claimed_by)?,
        claimed_at: parse_datetime(&claimed_at)?,
        last_checked_at: parse_datetime(&last_checked_at)?,
    })
}

impl WorkflowRepository for SqliteGateway {
    async fn put_workflow_version(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        version: &WorkflowVersion,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_versions (id, tenant_id, workflow_id, workflow_name, steps, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 tenant_id = excluded.tenant_id,
                 workflow_id = excluded.workflow_id,
                 workflow_name = excluded.workflow_name,
                 steps = excluded.steps",
        )
        .bind(version.id.to_string())
        .bind(tenant.to_string())
        .bind(version.workflow_id.to_string())
        .bind(&version.workflow_name)
        .bind(to_json(&version.steps)?)
        .bind(format_datetime(&stamp()))
        .execute(&mut *tx.conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workflow_versions(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        ids: &[Uuid],
    ) -> Result<Vec<WorkflowVersion>, RepositoryError> {
        let mut versions = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(
                "SELECT id, workflow_id, workflow_name, steps FROM workflow_versions WHERE tenant_id = ? AND id = ?",
            )
            .bind(tenant.to_string())
            .bind(id.to_string())
            .fetch_optional(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            if let Some(row) = row {
                versions.push(version_from_row(&row)?);
            }
        }
        Ok(versions)
    }

    async fn list_tenants(&self, tx: &mut SqliteTx) -> Result<Vec<TenantId>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT tenant_id FROM workflow_versions ORDER BY tenant_id")
                .fetch_all(&mut *tx.conn)
                .await
                .map_err(db_err)?;
        rows.iter().map(|(id,)| parse_tenant(id)).collect()
    }

    async fn get_idempotency_claim(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyClaim>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tenant_id, key, claimed_by, claimed_at, last_checked_at FROM idempotency_claims
             WHERE tenant_id = ? AND key = ?",
        )
        .bind(tenant.to_string())
        .bind(key.as_str())
        .fetch_optional(&mut *tx.conn)
        .await
        .map_err(db_err)?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn put_idempotency_claim(
        &self,
        tx: &mut SqliteTx,
        claim: &IdempotencyClaim,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO idempotency_claims (tenant_id, key, claimed_by, claimed_at, last_checked_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (tenant_id, key) DO UPDATE SET
                 claimed_by = excluded.claimed_by,
                 claimed_at = excluded.claimed_at,
                 last_checked_at = excluded.last_checked_at",
        )
        .bind(claim.tenant_id.to_string())
        .bind(claim.key.as_str())
        .bind(claim.claimed_by.to_string())
        .bind(format_datetime(&claim.claimed_at))
        .bind(format_datetime(&claim.last_checked_at))
        .execute(&mut *tx.conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
