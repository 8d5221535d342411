//! Automation rule
//!
//! A rule ties triggers, conditions and actions together with an execution
//! mode. Rules are owned by the engine registry; callers get clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::action::Action;
use crate::condition::Condition;
use crate::trigger::{default_enabled, Trigger};

/// How concurrent runs of the same rule are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// At most one run at a time
    #[default]
    Single,
    /// Runs may overlap
    Parallel,
    /// Runs are accepted while busy
    Queued,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Single => "single",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Queued => "queued",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ExecutionMode::Single),
            "parallel" => Ok(ExecutionMode::Parallel),
            "queued" => Ok(ExecutionMode::Queued),
            other => Err(format!("invalid execution mode: {}", other)),
        }
    }
}

/// Runtime status of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Idle,
    Running,
    Waiting,
    Error,
}

/// A single validation problem, keyed by field path (`triggers[0]`, `name`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Aggregated validation outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub(crate) fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn has_error_for(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

/// Automation rule
///
/// `Clone` copies everything except trigger subscriptions, which belong to
/// the registered instance only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub triggers: Vec<Trigger>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    pub actions: Vec<Action>,

    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub status: RuleStatus,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,

    #[serde(default)]
    pub run_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    // Runtime metadata
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

impl Rule {
    /// Create an enabled, empty rule
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            triggers: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            mode: ExecutionMode::Single,
            status: RuleStatus::Idle,
            variables: HashMap::new(),
            run_count: 0,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
            priority: 0,
            tags: Vec::new(),
            category: String::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<Condition>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Collect every structural problem
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push(ValidationError::new("name", "Rule name is required"));
        }
        if self.id.is_empty() {
            errors.push(ValidationError::new("id", "Rule ID is required"));
        }

        if self.triggers.is_empty() {
            errors.push(ValidationError::new(
                "triggers",
                "At least one trigger is required",
            ));
        }
        for (i, trigger) in self.triggers.iter().enumerate() {
            if let Err(e) = trigger.validate() {
                errors.push(ValidationError::new(format!("triggers[{}]", i), e.to_string()));
            }
        }

        for (i, condition) in self.conditions.iter().enumerate() {
            if let Err(e) = condition.validate() {
                errors.push(ValidationError::new(
                    format!("conditions[{}]", i),
                    e.to_string(),
                ));
            }
        }

        if self.actions.is_empty() {
            errors.push(ValidationError::new(
                "actions",
                "At least one action is required",
            ));
        }
        for (i, action) in self.actions.iter().enumerate() {
            if let Err(e) = action.validate() {
                errors.push(ValidationError::new(format!("actions[{}]", i), e.to_string()));
            }
        }

        ValidationResult::from_errors(errors)
    }

    /// Whether a new run may start now
    ///
    /// Advisory only: the check and the enqueue are not atomic.
    pub fn can_execute(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.mode {
            ExecutionMode::Single => self.status != RuleStatus::Running,
            ExecutionMode::Parallel | ExecutionMode::Queued => true,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Sum of the per-action estimates
    pub fn estimated_execution_time(&self) -> Duration {
        self.actions.iter().map(Action::estimate_execution_time).sum()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{DelayAction, ServiceAction};
    use crate::trigger::StateTrigger;

    fn sample_rule() -> Rule {
        Rule::new("rule_1", "Porch light")
            .with_trigger(StateTrigger::new("t1", "binary_sensor.motion"))
            .with_action(ServiceAction::new("a1", "light.turn_on"))
    }

    #[test]
    fn test_validate_valid_rule() {
        let result = sample_rule().validate();
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let rule = Rule::new("", "");
        let result = rule.validate();
        assert!(!result.valid);
        assert!(result.has_error_for("name"));
        assert!(result.has_error_for("id"));
        assert!(result.has_error_for("triggers"));
        assert!(result.has_error_for("actions"));
        assert!(result.errors.len() >= 4);
    }

    #[test]
    fn test_validate_reports_item_paths() {
        let rule = sample_rule()
            .with_trigger(StateTrigger::new("t2", ""))
            .with_action(DelayAction::new("a2", "later"));
        let result = rule.validate();
        assert!(result.has_error_for("triggers[1]"));
        assert!(result.has_error_for("actions[1]"));
        assert!(!result.has_error_for("triggers[0]"));
    }

    #[test]
    fn test_can_execute() {
        let mut single = sample_rule();
        assert!(single.can_execute());
        single.status = RuleStatus::Running;
        assert!(!single.can_execute());

        let mut parallel = sample_rule().with_mode(ExecutionMode::Parallel);
        parallel.status = RuleStatus::Running;
        assert!(parallel.can_execute());

        let mut queued = sample_rule().with_mode(ExecutionMode::Queued);
        queued.status = RuleStatus::Running;
        assert!(queued.can_execute());

        let mut disabled = sample_rule();
        disabled.enabled = false;
        assert!(!disabled.can_execute());
    }

    #[test]
    fn test_tags_and_estimate() {
        let mut rule = sample_rule().with_action(DelayAction::new("a2", "2s"));
        rule.tags = vec!["lighting".to_string()];
        assert!(rule.has_tag("lighting"));
        assert!(!rule.has_tag("security"));
        assert_eq!(rule.estimated_execution_time(), Duration::from_millis(2500));
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("queued".parse::<ExecutionMode>().unwrap(), ExecutionMode::Queued);
        assert!("restart".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Parallel.to_string(), "parallel");
    }
}
