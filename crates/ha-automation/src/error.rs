//! Engine-level errors
//!
//! Each evaluation module owns its own error enum (`TriggerError`,
//! `ConditionError`, `ActionError`, `ParseError`, `SchedulerError`).
//! [`AutomationError`] is what the engine returns to callers.

use thiserror::Error;

use crate::action::ActionError;
use crate::condition::ConditionError;
use crate::rule::ValidationError;
use crate::scheduler::SchedulerError;
use crate::trigger::TriggerError;

/// Automation engine errors
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Rule validation failed: {}", format_validation_errors(.0))]
    InvalidRule(Vec<ValidationError>),

    #[error("Rule cannot execute in current state: {0}")]
    CannotExecute(String),

    #[error("condition {index} failed: {source}")]
    ConditionFailed {
        index: usize,
        #[source]
        source: ConditionError,
    },

    #[error("action {index} failed: {source}")]
    ActionFailed {
        index: usize,
        #[source]
        source: ActionError,
    },

    #[error("Execution queue full")]
    QueueFull,

    #[error("Failed to setup trigger {trigger_id}: {reason}")]
    TriggerSetup { trigger_id: String, reason: String },

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Scheduler error: {0}")]
    Schedule(#[from] SchedulerError),

    #[error("Automation engine is already running")]
    AlreadyRunning,

    #[error("Automation engine is not running")]
    NotRunning,

    #[error("Rule execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rule execution cancelled")]
    Cancelled,
}

/// Result type for engine operations
pub type AutomationResult<T> = Result<T, AutomationError>;

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
