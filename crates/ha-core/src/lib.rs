//! Core types for the automation engine
//!
//! This crate provides the fundamental types shared by the automation crates:
//! the [`Event`] that triggers react to, JSON value helpers used for loose
//! comparisons, and Go-style duration strings (`"5s"`, `"1h30m"`).

mod duration;
mod event;
pub mod value;

pub use duration::{parse_duration, DurationError};
pub use event::{Event, EventPayload, EventType};

/// Standard event types understood by the automation engine
pub mod events {
    /// Event type for entity state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Synthetic event produced by the scheduler when a time trigger fires
    pub const TIME_TRIGGER: &str = "time_trigger";

    /// Event type for incoming webhook calls
    pub const WEBHOOK: &str = "webhook";

    /// Event type used when a rule is run by hand
    pub const MANUAL_TEST: &str = "manual_test";

    /// Event type for sun position changes (sunrise, sunset)
    pub const SUN_EVENT: &str = "sun_event";
}
