//! Infrastructure layer for Tasklane.
//!
//! Contains the SQLite implementation of the storage ports defined in
//! `tasklane-core` (tasks, events, matches, payloads, workflow versions and
//! advisory locks) and the `config.toml` loader.

pub mod config;
pub mod sqlite;
