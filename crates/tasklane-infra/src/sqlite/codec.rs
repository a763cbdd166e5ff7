//! Column encoding shared by the SQLite repositories.
//!
//! Timestamps are stored as RFC 3339 UTC with a fixed microsecond precision,
//! so text comparison in SQL orders them correctly and a value read back
//! equals the value written.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tasklane_types::error::RepositoryError;
use tasklane_types::task::TenantId;
use uuid::Uuid;

/// Current time at storage precision.
pub(crate) fn stamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid uuid '{s}': {e}")))
}

pub(crate) fn parse_tenant(s: &str) -> Result<TenantId, RepositoryError> {
    parse_uuid(s).map(TenantId::from_uuid)
}

pub(crate) fn parse_enum<T>(s: &str) -> Result<T, RepositoryError>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse().map_err(|e: T::Err| RepositoryError::Query(e.to_string()))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}

pub(crate) fn opt_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

pub(crate) fn from_opt_json<T: DeserializeOwned>(s: Option<&str>) -> Result<Option<T>, RepositoryError> {
    s.map(from_json).transpose()
}

/// Map a sqlx error, turning unique-constraint violations into conflicts.
pub(crate) fn db_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
            RepositoryError::Conflict(db_err.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}
