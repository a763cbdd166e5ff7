//! Shared domain types for Tasklane.
//!
//! Tasks, task events, matches and their conditions, DAGs, workflow
//! definitions, payload keys and engine configuration, plus the repository
//! error type used by the storage ports in `tasklane-core`.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod matching;
pub mod payload;
pub mod task;
pub mod workflow;
