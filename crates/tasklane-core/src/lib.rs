//! Task state machine, match engine and repository trait definitions for
//! Tasklane.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `tasklane-types` -- never on
//! `tasklane-infra` or any database/IO crate.

pub mod cache;
pub mod engine;
pub mod event;
pub mod expression;
pub mod graph;
pub mod hash;
pub mod hooks;
pub mod limiter;
pub mod matching;
pub mod replay;
pub mod repository;
pub mod trigger;

pub use engine::{EngineError, TaskEngine};
