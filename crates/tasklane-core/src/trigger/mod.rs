//! DAG/trigger builder: the conditions a step waits on and the idempotency
//! rules of triggers. The transactional trigger flow lives in
//! `engine::trigger`.

pub mod builder;
pub mod idempotency;

pub use builder::{
    dag_task_external_id, extra_conditions, fan_in_conditions, on_failure_conditions, sleep_durations,
    wait_conditions,
};
pub use idempotency::{run_key, wait_for_key};
