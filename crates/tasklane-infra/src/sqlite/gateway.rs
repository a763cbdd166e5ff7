//! SQLite storage gateway.
//!
//! `SqliteGateway` implements every repository port of `tasklane-core` over
//! one `DatabasePool`. Each engine operation runs in a `SqliteTx` taken from
//! the writer pool. Advisory locks taken by a transaction are rows in
//! `advisory_locks` owned by the transaction's holder id; they are deleted
//! just before commit and vanish with a rollback.

use sqlx::{Sqlite, Transaction};
use tasklane_core::repository::Transactional;
use tasklane_types::error::RepositoryError;
use uuid::Uuid;

use super::codec::db_err;
use super::pool::DatabasePool;

/// SQLite-backed implementation of the engine's storage gateway.
#[derive(Clone)]
pub struct SqliteGateway {
    pub(crate) pool: DatabasePool,
}

impl SqliteGateway {
    /// Create a new gateway backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

/// An open write transaction.
pub struct SqliteTx {
    pub(crate) conn: Transaction<'static, Sqlite>,
    /// Owner of the advisory locks this transaction takes.
    pub(crate) holder_id: String,
    pub(crate) holds_locks: bool,
}

impl Transactional for SqliteGateway {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx, RepositoryError> {
        let conn = self.pool.writer.begin().await.map_err(db_err)?;
        Ok(SqliteTx {
            conn,
            holder_id: format!("tx:{}", Uuid::now_v7()),
            holds_locks: false,
        })
    }

    async fn commit(&self, tx: SqliteTx) -> Result<(), RepositoryError> {
        let SqliteTx {
            mut conn,
            holder_id,
            holds_locks,
        } = tx;
        if holds_locks {
            let released = sqlx::query("DELETE FROM advisory_locks WHERE holder_id = ?")
                .bind(&holder_id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?
                .rows_affected();
            tracing::trace!(released, "advisory locks released");
        }
        conn.commit().await.map_err(db_err)
    }

    async fn rollback(&self, tx: SqliteTx) -> Result<(), RepositoryError> {
        tx.conn.rollback().await.map_err(db_err)
    }
}
