//! Payload store trait definition.

use std::collections::HashMap;

use serde_json::Value;
use tasklane_types::error::RepositoryError;
use tasklane_types::payload::{PayloadKey, StorePayload};
use tasklane_types::task::TenantId;

use super::Transactional;

/// Storage for task inputs, DAG inputs and event data.
pub trait PayloadStore: Transactional {
    /// Write payloads, replacing any existing value under the same key.
    fn store_payloads(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        payloads: &[StorePayload],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Read payloads. Keys with no stored value are absent from the map.
    fn retrieve_payloads(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        keys: &[PayloadKey],
    ) -> impl std::future::Future<Output = Result<HashMap<PayloadKey, Value>, RepositoryError>> + Send;
}
