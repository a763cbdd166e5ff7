//! SQLite payload store implementation.

use std::collections::HashMap;

use serde_json::Value;
use tasklane_core::repository::PayloadStore;
use tasklane_types::error::RepositoryError;
use tasklane_types::payload::{PayloadKey, StorePayload};
use tasklane_types::task::TenantId;

use super::codec::{db_err, format_datetime, from_json, to_json};
use super::gateway::{SqliteGateway, SqliteTx};

impl PayloadStore for SqliteGateway {
    async fn store_payloads(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        payloads: &[StorePayload],
    ) -> Result<(), RepositoryError> {
        for payload in payloads {
            sqlx::query(
                "INSERT INTO payloads (tenant_id, payload_type, id, inserted_at, value) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (tenant_id, payload_type, id, inserted_at) DO UPDATE SET value = excluded.value",
            )
            .bind(tenant.to_string())
            .bind(payload.key.payload_type.as_str())
            .bind(payload.key.id)
            .bind(format_datetime(&payload.key.inserted_at))
            .bind(to_json(&payload.value)?)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn retrieve_payloads(
        &self,
        tx: &mut SqliteTx,
        tenant: TenantId,
        keys: &[PayloadKey],
    ) -> Result<HashMap<PayloadKey, Value>, RepositoryError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let value: Option<(String,)> = sqlx::query_as(
                "SELECT value FROM payloads WHERE tenant_id = ? AND payload_type = ? AND id = ? AND inserted_at = ?",
            )
            .bind(tenant.to_string())
            .bind(key.payload_type.as_str())
            .bind(key.id)
            .bind(format_datetime(&key.inserted_at))
            .fetch_optional(&mut *tx.conn)
            .await
            .map_err(db_err)?;
            if let Some((value,)) = value {
                found.insert(*key, from_json(&value)?);
            }
        }
        Ok(found)
    }
}
