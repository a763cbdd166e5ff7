//! SQLite storage layer.
//!
//! One gateway implementing every repository port, backed by SQLite with WAL
//! mode on a single writer connection. Advisory locks are rows in the same
//! database, so they hold across processes.

mod codec;
mod event;
pub mod gateway;
mod lock;
mod matching;
mod payload;
pub mod pool;
mod task;
mod workflow;

#[cfg(test)]
mod scenarios;

pub use gateway::{SqliteGateway, SqliteTx};
pub use pool::DatabasePool;
