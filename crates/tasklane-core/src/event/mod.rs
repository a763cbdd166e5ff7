//! In-process publication of committed task events.

pub mod bus;

pub use bus::EventBus;
