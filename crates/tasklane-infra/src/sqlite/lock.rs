//! SQLite advisory locks.
//!
//! One row per held key in `advisory_locks`. Taking a key is an upsert that
//! only overwrites a row already owned by the same holder or past its
//! expiry, so `rows_affected` says whether the key was acquired.

use chrono::Duration;
use tasklane_core::repository::AdvisoryLocks;
use tasklane_types::error::RepositoryError;

use super::codec::{db_err, format_datetime, stamp};
use super::gateway::{SqliteGateway, SqliteTx};

/// Expiry written on transaction-held rows. They are removed at commit, so
/// this only bounds a row that somehow outlived its transaction.
const TX_LOCK_TTL_SECS: i64 = 300;

const UPSERT_LOCK: &str = "INSERT INTO advisory_locks (lock_key, holder_id, expires_at)
     VALUES (?, ?, ?)
     ON CONFLICT(lock_key) DO UPDATE
        SET holder_id = excluded.holder_id, expires_at = excluded.expires_at
      WHERE advisory_locks.holder_id = excluded.holder_id
         OR advisory_locks.expires_at <= ?";

async fn take(
    tx: &mut SqliteTx,
    key: i64,
    holder: &str,
    ttl_secs: i64,
) -> Result<bool, RepositoryError> {
    let now = stamp();
    let expires_at = now + Duration::seconds(ttl_secs.max(0));
    let affected = sqlx::query(UPSERT_LOCK)
        .bind(key)
        .bind(holder)
        .bind(format_datetime(&expires_at))
        .bind(format_datetime(&now))
        .execute(&mut *tx.conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    Ok(affected > 0)
}

impl AdvisoryLocks for SqliteGateway {
    async fn try_advisory_locks(
        &self,
        tx: &mut SqliteTx,
        keys: &[i64],
    ) -> Result<Vec<i64>, RepositoryError> {
        let holder = tx.holder_id.clone();
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            if take(tx, *key, &holder, TX_LOCK_TTL_SECS).await? {
                acquired.push(*key);
            } else {
                tracing::debug!(lock_key = key, "advisory lock held elsewhere");
            }
        }
        if !acquired.is_empty() {
            tx.holds_locks = true;
        }
        Ok(acquired)
    }

    async fn acquire_lock_lease(
        &self,
        tx: &mut SqliteTx,
        key: i64,
        holder: &str,
        ttl_secs: i64,
    ) -> Result<bool, RepositoryError> {
        take(tx, key, holder, ttl_secs).await
    }

    async fn release_lock_lease(
        &self,
        tx: &mut SqliteTx,
        key: i64,
        holder: &str,
    ) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM advisory_locks WHERE lock_key = ? AND holder_id = ?")
            .bind(key)
            .bind(holder)
            .execute(&mut *tx.conn)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use tasklane_core::repository::Transactional;

    use super::*;
    use crate::sqlite::DatabasePool;

    async fn test_gateway() -> SqliteGateway {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteGateway::new(DatabasePool::new(&url).await.unwrap())
    }

    async fn lock_rows(gateway: &SqliteGateway) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM advisory_locks")
            .fetch_one(&gateway.pool.writer)
            .await
            .unwrap();
        count
    }

    async fn hold_lease(gateway: &SqliteGateway, key: i64, holder: &str, ttl_secs: i64) -> bool {
        let mut tx = gateway.begin().await.unwrap();
        let held = gateway.acquire_lock_lease(&mut tx, key, holder, ttl_secs).await.unwrap();
        gateway.commit(tx).await.unwrap();
        held
    }

    #[tokio::test]
    async fn test_locks_are_reentrant_and_released_on_commit() {
        let gateway = test_gateway().await;
        let mut tx = gateway.begin().await.unwrap();
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[1, 2]).await.unwrap(), vec![1, 2]);
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[2]).await.unwrap(), vec![2]);
        gateway.commit(tx).await.unwrap();
        assert_eq!(lock_rows(&gateway).await, 0);

        let mut tx = gateway.begin().await.unwrap();
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[1]).await.unwrap(), vec![1]);
        gateway.rollback(tx).await.unwrap();
        assert_eq!(lock_rows(&gateway).await, 0);
    }

    #[tokio::test]
    async fn test_locks_vanish_when_tx_is_dropped() {
        let gateway = test_gateway().await;
        let mut tx = gateway.begin().await.unwrap();
        gateway.try_advisory_locks(&mut tx, &[7]).await.unwrap();
        drop(tx);

        let mut tx = gateway.begin().await.unwrap();
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[7]).await.unwrap(), vec![7]);
        gateway.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_excludes_transactions_until_released() {
        let gateway = test_gateway().await;
        assert!(hold_lease(&gateway, 9, "maintenance", 60).await);

        let mut tx = gateway.begin().await.unwrap();
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[9, 10]).await.unwrap(), vec![10]);
        gateway.commit(tx).await.unwrap();
        assert_eq!(lock_rows(&gateway).await, 1);

        let mut tx = gateway.begin().await.unwrap();
        assert!(!gateway.release_lock_lease(&mut tx, 9, "someone-else").await.unwrap());
        assert!(gateway.release_lock_lease(&mut tx, 9, "maintenance").await.unwrap());
        assert_eq!(gateway.try_advisory_locks(&mut tx, &[9]).await.unwrap(), vec![9]);
        gateway.commit(tx).await.unwrap();
        assert_eq!(lock_rows(&gateway).await, 0);
    }

    #[tokio::test]
    async fn test_lease_is_renewed_by_its_holder_only() {
        let gateway = test_gateway().await;
        assert!(hold_lease(&gateway, 3, "controller-a", 60).await);
        assert!(hold_lease(&gateway, 3, "controller-a", 60).await);
        assert!(!hold_lease(&gateway, 3, "controller-b", 60).await);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let gateway = test_gateway().await;
        assert!(hold_lease(&gateway, 4, "controller-a", 0).await);
        assert!(hold_lease(&gateway, 4, "controller-b", 60).await);
        assert!(!hold_lease(&gateway, 4, "controller-a", 60).await);
    }
}
