//! Rule-based automation engine
//!
//! Rules react to events: triggers decide whether an event starts a rule,
//! conditions gate the run and actions do the work.
//!
//! # Architecture
//!
//! ```text
//! RULE = TRIGGERS → CONDITIONS → ACTIONS
//! ```
//!
//! - **Triggers**: state changes, time (cron/at/interval), events, webhooks
//! - **Conditions**: entity state, time windows, numeric thresholds, templates
//! - **Actions**: service calls, notifications, delays, variables, HTTP
//!   requests, scripts, conditional branches
//!
//! The [`AutomationEngine`] holds the rule registry, a bounded execution
//! queue and a fixed worker pool. Time triggers are driven by the cron
//! [`Scheduler`]. Every run gets an [`ExecutionContext`] recording a trace of
//! each condition and action.
//!
//! # Key Types
//!
//! - [`Rule`] - Complete rule definition
//! - [`RuleParser`] - JSON/YAML rule documents, native or hub-style
//! - [`AutomationEngine`] - Registry and executor
//! - [`ServiceCaller`], [`NotificationSink`] - Collaborators used by actions

pub mod action;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod parser;
pub mod rule;
pub mod scheduler;
pub mod template;
pub mod trigger;

use std::collections::HashMap;

/// Variables visible to conditions, templates and actions during a run
pub type Variables = HashMap<String, serde_json::Value>;

pub use action::{
    Action, ActionEnv, ActionError, ActionResult, LoggingNotificationSink, LoggingServiceCaller,
    Notification, NotificationChannel, NotificationSink, ServiceCall, ServiceCaller,
};
pub use condition::{Condition, ConditionError, ConditionResult};
pub use context::{ExecutionContext, ExecutionContextManager, TraceEntry, TracePhase};
pub use engine::{AutomationEngine, EngineConfig, EngineStatistics, ExecutionRequest, TestRun};
pub use error::{AutomationError, AutomationResult};
pub use parser::{ParseError, ParseResult, RuleFormat, RuleParser};
pub use rule::{ExecutionMode, Rule, RuleStatus, ValidationError, ValidationResult};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerResult};
pub use trigger::{LogicOperator, Trigger, TriggerError, TriggerHandler, TriggerResult};
