//! Terminal status of a finalized run.

use tasklane_types::dag::RunStatus;
use tasklane_types::event::TaskEventType;

/// `FAILED` if any step failed, else `CANCELLED` if any was cancelled, else
/// `COMPLETED`. Skipped steps completed with a skip marker.
pub fn run_status<'a>(events: impl IntoIterator<Item = &'a TaskEventType>) -> RunStatus {
    let mut status = RunStatus::Completed;
    for event_type in events {
        match event_type {
            TaskEventType::Failed => return RunStatus::Failed,
            TaskEventType::Cancelled => status = RunStatus::Cancelled,
            _ => {}
        }
    }
    status
}
