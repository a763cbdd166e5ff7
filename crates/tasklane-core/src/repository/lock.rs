//! Advisory lock trait definition.

use tasklane_types::error::RepositoryError;

use super::Transactional;

/// Advisory locks keyed by opaque 64-bit keys.
///
/// A key is held either by one transaction, until it commits or rolls back,
/// or by a named lease holder until the lease expires or is released. Both
/// kinds exclude each other.
pub trait AdvisoryLocks: Transactional {
    /// Try to take each lock for the lifetime of `tx` without waiting.
    /// Returns the keys acquired. Re-entrant within one transaction.
    fn try_advisory_locks(
        &self,
        tx: &mut Self::Tx,
        keys: &[i64],
    ) -> impl std::future::Future<Output = Result<Vec<i64>, RepositoryError>> + Send;

    /// Take or renew a lease on `key` for `holder`. Fails (returns false)
    /// while another holder or a transaction has it and it has not expired.
    /// The lease becomes visible when `tx` commits.
    fn acquire_lock_lease(
        &self,
        tx: &mut Self::Tx,
        key: i64,
        holder: &str,
        ttl_secs: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop `holder`'s lease on `key`. Returns false if it held none.
    fn release_lock_lease(
        &self,
        tx: &mut Self::Tx,
        key: i64,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
