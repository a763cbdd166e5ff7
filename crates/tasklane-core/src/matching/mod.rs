//! Match/condition engine: routing candidate events to waiting conditions and
//! resolving satisfied matches into actions.
//!
//! The transactional half (persisting satisfaction, closing matches and
//! applying their effects) lives in `engine::matching`.

pub mod conditions;
pub mod resolve;

pub use conditions::{dedupe_hintless, evaluate_conditions, event_applies, lookups};
pub use resolve::{resolve_match, satisfied_actions};
