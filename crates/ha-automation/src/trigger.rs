//! Trigger types
//!
//! Triggers decide whether an incoming [`Event`] should start a rule. A
//! matching trigger returns the variables it extracted from the event; those
//! are merged into the execution context by the engine.
//!
//! Triggers can also carry a push-dispatch handler (see [`Trigger::subscribe`]).
//! The handler is runtime state: it is never serialized and is dropped when a
//! trigger is cloned.

use chrono::NaiveTime;
use ha_core::value::values_equal;
use ha_core::{events, parse_duration, Event};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::error::AutomationResult;
use crate::Variables;

/// Trigger errors
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("{0}")]
    Invalid(String),

    #[error("Trigger {0} has no subscribed handler")]
    NotSubscribed(String),
}

/// Result type for trigger operations
pub type TriggerResult<T> = Result<T, TriggerError>;

/// Future returned by a trigger handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = AutomationResult<()>> + Send>>;

/// Callback invoked when a trigger fires via push dispatch
pub type TriggerHandler = Arc<dyn Fn(Trigger, Event) -> HandlerFuture + Send + Sync>;

/// Slot holding a trigger's handler
///
/// Cloning yields an empty slot.
#[derive(Default)]
pub struct Subscription(Option<TriggerHandler>);

impl Clone for Subscription {
    fn clone(&self) -> Self {
        Self(None)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Subscription(active)"
        } else {
            "Subscription(none)"
        })
    }
}

/// Operator combining composite children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogicOperator {
    #[default]
    And,
    Or,
}

impl LogicOperator {
    /// Combine child results
    pub fn combine(self, results: impl IntoIterator<Item = bool>) -> bool {
        let mut results = results.into_iter();
        match self {
            LogicOperator::And => results.all(|r| r),
            LogicOperator::Or => results.any(|r| r),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogicOperator::And => "and",
            LogicOperator::Or => "or",
        }
    }
}

pub(crate) fn default_enabled() -> bool {
    true
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

/// Parse a time of day in `HH:MM` or `HH:MM:SS` form
pub(crate) fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Trigger definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires when an entity's state changes
    State(StateTrigger),

    /// Fires on scheduler ticks
    Time(TimeTrigger),

    /// Fires on any event with optional data matching
    Event(EventTrigger),

    /// Fires on webhook request
    Webhook(WebhookTrigger),

    /// Combines other triggers with and/or
    Composite(CompositeTrigger),
}

/// State change trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Entity to monitor
    #[serde(default)]
    pub entity_id: String,

    /// Previous state to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,

    /// New state to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,

    #[serde(skip)]
    subscription: Subscription,
}

impl StateTrigger {
    pub fn new(id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            entity_id: entity_id.into(),
            from: None,
            to: None,
            subscription: Subscription::default(),
        }
    }

    /// Require the previous state
    pub fn from_state(mut self, state: impl Into<Value>) -> Self {
        self.from = Some(state.into());
        self
    }

    /// Require the new state
    pub fn to_state(mut self, state: impl Into<Value>) -> Self {
        self.to = Some(state.into());
        self
    }
}

/// Time trigger
///
/// Exactly one of `at`, `cron` and `interval` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time of day (`HH:MM` or `HH:MM:SS`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,

    /// Cron expression (5, 6 or 7 fields)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Repeat interval (e.g., `"5m"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(skip)]
    subscription: Subscription,
}

impl TimeTrigger {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            at: None,
            cron: None,
            interval: None,
            subscription: Subscription::default(),
        }
    }

    pub fn at(id: impl Into<String>, at: impl Into<String>) -> Self {
        Self {
            at: Some(at.into()),
            ..Self::new(id)
        }
    }

    pub fn cron(id: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            ..Self::new(id)
        }
    }

    pub fn interval(id: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            interval: Some(interval.into()),
            ..Self::new(id)
        }
    }

    /// Variables for a run started by a scheduler fire
    pub fn fire_data(&self, event: &Event) -> Variables {
        let trigger_time = event
            .data
            .get("trigger_time")
            .cloned()
            .unwrap_or_else(|| json!(event.timestamp.to_rfc3339()));

        let mut data = Variables::new();
        data.insert("trigger_time".to_string(), trigger_time);
        data.insert("trigger_type".to_string(), json!("time"));
        data
    }

    /// Check the `at`/`cron`/`interval` fields
    pub fn validate(&self) -> TriggerResult<()> {
        if self.id.is_empty() {
            return Err(invalid("trigger ID is required"));
        }

        let mut count = 0;
        if let Some(at) = non_empty(&self.at) {
            count += 1;
            if parse_time_of_day(at).is_none() {
                return Err(invalid(format!("invalid time format for 'at': {}", at)));
            }
        }
        if let Some(expr) = non_empty(&self.cron) {
            count += 1;
            if crate::scheduler::parse_cron(expr).is_err() {
                return Err(invalid(format!("invalid cron expression: {}", expr)));
            }
        }
        if let Some(interval) = non_empty(&self.interval) {
            count += 1;
            if parse_duration(interval).is_err() {
                return Err(invalid(format!("invalid interval: {}", interval)));
            }
        }

        if count != 1 {
            return Err(invalid(
                "exactly one of 'at', 'cron', or 'interval' must be specified",
            ));
        }
        Ok(())
    }
}

/// Event trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Event type to match
    #[serde(default)]
    pub event_type: String,

    /// Key subset the event data must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Map<String, Value>>,

    #[serde(skip)]
    subscription: Subscription,
}

impl EventTrigger {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            event_type: event_type.into(),
            event_data: None,
            subscription: Subscription::default(),
        }
    }

    /// Require a payload field
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.event_data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Webhook trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_id: String,

    /// HTTP method to match; empty accepts any
    #[serde(default = "default_webhook_method")]
    pub method: String,

    #[serde(skip)]
    subscription: Subscription,
}

impl WebhookTrigger {
    pub fn new(id: impl Into<String>, webhook_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            webhook_id: webhook_id.into(),
            method: default_webhook_method(),
            subscription: Subscription::default(),
        }
    }
}

/// Composite trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub operator: LogicOperator,

    #[serde(default)]
    pub triggers: Vec<Trigger>,

    #[serde(skip)]
    subscription: Subscription,
}

impl CompositeTrigger {
    pub fn new(id: impl Into<String>, operator: LogicOperator, triggers: Vec<Trigger>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            operator,
            triggers,
            subscription: Subscription::default(),
        }
    }
}

impl Trigger {
    /// Get the trigger ID
    pub fn id(&self) -> &str {
        match self {
            Trigger::State(t) => &t.id,
            Trigger::Time(t) => &t.id,
            Trigger::Event(t) => &t.id,
            Trigger::Webhook(t) => &t.id,
            Trigger::Composite(t) => &t.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            Trigger::State(t) => t.id = id,
            Trigger::Time(t) => t.id = id,
            Trigger::Event(t) => t.id = id,
            Trigger::Webhook(t) => t.id = id,
            Trigger::Composite(t) => t.id = id,
        }
    }

    /// Get the type discriminant
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::State(_) => "state",
            Trigger::Time(_) => "time",
            Trigger::Event(_) => "event",
            Trigger::Webhook(_) => "webhook",
            Trigger::Composite(_) => "composite",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Trigger::State(t) => t.enabled,
            Trigger::Time(t) => t.enabled,
            Trigger::Event(t) => t.enabled,
            Trigger::Webhook(t) => t.enabled,
            Trigger::Composite(t) => t.enabled,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Trigger::State(t) => t.enabled = enabled,
            Trigger::Time(t) => t.enabled = enabled,
            Trigger::Event(t) => t.enabled = enabled,
            Trigger::Webhook(t) => t.enabled = enabled,
            Trigger::Composite(t) => t.enabled = enabled,
        }
    }

    /// Get the time trigger, if this is one
    pub fn as_time(&self) -> Option<&TimeTrigger> {
        match self {
            Trigger::Time(t) => Some(t),
            _ => None,
        }
    }

    /// Evaluate the trigger against an event
    ///
    /// Returns the extracted variables when the trigger matches.
    pub fn evaluate(&self, event: &Event) -> TriggerResult<Option<Variables>> {
        if !self.enabled() {
            return Ok(None);
        }

        let result = match self {
            Trigger::State(t) => evaluate_state(t, event),
            // Time triggers fire only through the scheduler
            Trigger::Time(_) => None,
            Trigger::Event(t) => evaluate_event(t, event),
            Trigger::Webhook(t) => evaluate_webhook(t, event),
            Trigger::Composite(t) => evaluate_composite(t, event)?,
        };

        trace!(
            trigger_id = %self.id(),
            trigger_type = self.kind(),
            matched = result.is_some(),
            "Trigger evaluated"
        );
        Ok(result)
    }

    /// Validate the trigger configuration
    pub fn validate(&self) -> TriggerResult<()> {
        if self.id().is_empty() {
            return Err(invalid("trigger ID is required"));
        }

        match self {
            Trigger::State(t) => {
                if t.entity_id.is_empty() {
                    return Err(invalid("entity_id is required for state trigger"));
                }
            }
            Trigger::Time(t) => t.validate()?,
            Trigger::Event(t) => {
                if t.event_type.is_empty() {
                    return Err(invalid("event_type is required for event trigger"));
                }
            }
            Trigger::Webhook(t) => {
                if t.webhook_id.is_empty() {
                    return Err(invalid("webhook_id is required for webhook trigger"));
                }
            }
            Trigger::Composite(t) => {
                if t.triggers.len() < 2 {
                    return Err(invalid("composite trigger must have at least 2 triggers"));
                }
                for (i, child) in t.triggers.iter().enumerate() {
                    child
                        .validate()
                        .map_err(|e| invalid(format!("trigger {}: {}", i, e)))?;
                }
            }
        }
        Ok(())
    }

    /// Attach a push-dispatch handler, replacing any previous one
    pub fn subscribe(&mut self, handler: TriggerHandler) {
        self.subscription_mut().0 = Some(handler);
    }

    /// Detach the handler
    pub fn unsubscribe(&mut self) {
        self.subscription_mut().0 = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription().0.is_some()
    }

    /// Get a handle on the subscribed handler
    pub fn handler(&self) -> Option<TriggerHandler> {
        self.subscription().0.clone()
    }

    /// Invoke the subscribed handler with an event
    pub async fn fire(&self, event: Event) -> AutomationResult<()> {
        let handler = self
            .handler()
            .ok_or_else(|| TriggerError::NotSubscribed(self.id().to_string()))?;
        handler(self.clone(), event).await
    }

    fn subscription(&self) -> &Subscription {
        match self {
            Trigger::State(t) => &t.subscription,
            Trigger::Time(t) => &t.subscription,
            Trigger::Event(t) => &t.subscription,
            Trigger::Webhook(t) => &t.subscription,
            Trigger::Composite(t) => &t.subscription,
        }
    }

    fn subscription_mut(&mut self) -> &mut Subscription {
        match self {
            Trigger::State(t) => &mut t.subscription,
            Trigger::Time(t) => &mut t.subscription,
            Trigger::Event(t) => &mut t.subscription,
            Trigger::Webhook(t) => &mut t.subscription,
            Trigger::Composite(t) => &mut t.subscription,
        }
    }
}

impl From<StateTrigger> for Trigger {
    fn from(t: StateTrigger) -> Self {
        Trigger::State(t)
    }
}

impl From<TimeTrigger> for Trigger {
    fn from(t: TimeTrigger) -> Self {
        Trigger::Time(t)
    }
}

impl From<EventTrigger> for Trigger {
    fn from(t: EventTrigger) -> Self {
        Trigger::Event(t)
    }
}

impl From<WebhookTrigger> for Trigger {
    fn from(t: WebhookTrigger) -> Self {
        Trigger::Webhook(t)
    }
}

impl From<CompositeTrigger> for Trigger {
    fn from(t: CompositeTrigger) -> Self {
        Trigger::Composite(t)
    }
}

// --- Evaluation ---

fn evaluate_state(trigger: &StateTrigger, event: &Event) -> Option<Variables> {
    if event.event_type != events::STATE_CHANGED
        || event.entity_id.as_deref() != Some(trigger.entity_id.as_str())
    {
        return None;
    }

    if let Some(from) = &trigger.from {
        let old_state = event.data.get("old_state").unwrap_or(&Value::Null);
        if !values_equal(old_state, from) {
            return None;
        }
    }
    if let Some(to) = &trigger.to {
        let new_state = event.data.get("new_state").unwrap_or(&Value::Null);
        if !values_equal(new_state, to) {
            return None;
        }
    }

    let mut data = Variables::new();
    data.insert("entity_id".to_string(), json!(trigger.entity_id));
    data.insert("event".to_string(), Value::Object(event.data.clone()));
    Some(data)
}

fn evaluate_event(trigger: &EventTrigger, event: &Event) -> Option<Variables> {
    if event.event_type.as_str() != trigger.event_type {
        return None;
    }

    if let Some(expected) = &trigger.event_data {
        let all_match = expected.iter().all(|(key, expected_value)| {
            event
                .data
                .get(key)
                .map(|actual| values_equal(actual, expected_value))
                .unwrap_or(false)
        });
        if !all_match {
            return None;
        }
    }

    let mut data = Variables::new();
    data.insert("event_type".to_string(), json!(event.event_type.as_str()));
    data.insert("event_data".to_string(), Value::Object(event.data.clone()));
    Some(data)
}

fn evaluate_webhook(trigger: &WebhookTrigger, event: &Event) -> Option<Variables> {
    if event.event_type != events::WEBHOOK {
        return None;
    }

    let webhook_id = event.data.get("webhook_id").and_then(Value::as_str)?;
    if webhook_id != trigger.webhook_id {
        return None;
    }

    let method = event
        .data
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !trigger.method.is_empty() && method != trigger.method {
        return None;
    }

    let field = |key: &str| event.data.get(key).cloned().unwrap_or(Value::Null);
    let mut data = Variables::new();
    data.insert("webhook_id".to_string(), json!(webhook_id));
    data.insert("method".to_string(), json!(method));
    data.insert("payload".to_string(), field("payload"));
    data.insert("headers".to_string(), field("headers"));
    Some(data)
}

fn evaluate_composite(
    trigger: &CompositeTrigger,
    event: &Event,
) -> TriggerResult<Option<Variables>> {
    let mut results = Vec::with_capacity(trigger.triggers.len());
    let mut data = Variables::new();

    for (i, child) in trigger.triggers.iter().enumerate() {
        let child_result = child.evaluate(event)?;
        if let Some(child_data) = &child_result {
            for (key, value) in child_data {
                data.insert(format!("trigger_{}_{}", i, key), value.clone());
            }
        }
        results.push(child_result.is_some());
    }

    Ok(trigger.operator.combine(results).then_some(data))
}

// --- Utility functions ---

fn invalid(message: impl fmt::Display) -> TriggerError {
    TriggerError::Invalid(message.to_string())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
