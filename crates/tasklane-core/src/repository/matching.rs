//! Match repository trait definition.

use serde_json::Value;
use tasklane_types::error::RepositoryError;
use tasklane_types::matching::{GroupMatchCondition, Match, MatchEventType, NewMatch};
use tasklane_types::task::{TaskIdInsertedAtRetryCount, TenantId};

use super::Transactional;

/// One `(event type, key, hint)` triple to look conditions up by.
///
/// A hinted lookup finds conditions with the same hint or no hint; a hintless
/// lookup only finds conditions without a hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionLookup {
    pub event_type: MatchEventType,
    pub event_key: String,
    pub resource_hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SatisfiedCondition {
    pub id: i64,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct ClosedMatch {
    pub id: i64,
    pub aggregated_data: Value,
}

/// Storage for matches and their condition groups.
pub trait MatchRepository: Transactional {
    /// Insert matches with their conditions. Conditions carrying
    /// `satisfied_data` are stored satisfied.
    fn insert_matches(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        matches: &[NewMatch],
    ) -> impl std::future::Future<Output = Result<Vec<Match>, RepositoryError>> + Send;

    /// Unsatisfied conditions of unsatisfied matches hit by any lookup,
    /// ordered by id.
    fn list_candidate_conditions(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        lookups: &[ConditionLookup],
    ) -> impl std::future::Future<Output = Result<Vec<GroupMatchCondition>, RepositoryError>> + Send;

    fn satisfy_conditions(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        conditions: &[SatisfiedCondition],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Matches with all of their conditions.
    fn get_matches(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        ids: &[i64],
    ) -> impl std::future::Future<Output = Result<Vec<Match>, RepositoryError>> + Send;

    /// Mark matches satisfied, guarded on them still being open. Returns the
    /// ids this call closed; a match is closed at most once.
    fn close_matches(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        matches: &[ClosedMatch],
    ) -> impl std::future::Future<Output = Result<Vec<i64>, RepositoryError>> + Send;

    /// Delete the open signal matches registered by `attempts`, with their
    /// conditions. Returns how many matches were removed.
    fn delete_signal_matches(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        attempts: &[TaskIdInsertedAtRetryCount],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
