//! Broadcast event bus for committed task events.
//!
//! Built on `tokio::sync::broadcast`. Events are published by a post-commit
//! hook, so subscribers only ever see events that are durable. Publishing with
//! no active subscribers is a no-op.

use tasklane_types::event::TaskEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus of committed `TaskEvent`s.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
