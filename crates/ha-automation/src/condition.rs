//! Condition types
//!
//! Conditions gate rule execution. They are evaluated against the execution
//! variables, where entity state is provided under `entity_<entity_id>` keys
//! as `{"state": ..., "attributes": {...}}`.

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Weekday};
use ha_core::value::{as_f64, display_value, values_equal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::template::evaluate_simple;
use crate::trigger::{default_enabled, parse_time_of_day, LogicOperator};
use crate::Variables;

/// Condition errors
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("{0}")]
    Invalid(String),

    #[error("entity {0} not found in context")]
    EntityNotFound(String),

    #[error("invalid entity data format for {0}")]
    InvalidEntityData(String),

    #[error("entity attributes not found for {0}")]
    AttributesNotFound(String),

    #[error("cannot convert value to number: {0}")]
    NotNumeric(String),

    #[error("template result cannot be converted to boolean: {0}")]
    NotBoolean(String),

    #[error("template pattern failed to compile: {0}")]
    Template(#[from] regex::Error),
}

/// Result type for condition operations
pub type ConditionResult<T> = Result<T, ConditionError>;

/// Condition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Entity state or attribute check
    State(StateCondition),

    /// Time window, weekday and date range check
    Time(TimeCondition),

    /// Numeric threshold check
    Numeric(NumericCondition),

    /// Rendered template coerced to a boolean
    Template(TemplateCondition),

    /// Combines other conditions with and/or
    Composite(CompositeCondition),
}

/// State condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCondition {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub entity_id: String,

    /// Expected value; unset only requires the entity to exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    /// Compare this attribute instead of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl StateCondition {
    pub fn new(id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            entity_id: entity_id.into(),
            state: None,
            attribute: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<Value>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

/// Time condition
///
/// `after`/`before` are times of day, `weekdays` lowercase three-letter names,
/// `start_date`/`end_date` are `YYYY-MM-DD`. All set constraints must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeCondition {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl TimeCondition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            before: None,
            after: None,
            weekdays: Vec::new(),
            start_date: None,
            end_date: None,
        }
    }

    /// Evaluate against a given instant
    fn matches_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> ConditionResult<bool> {
        let time = now.time();

        if let Some(after) = self.after.as_deref().filter(|s| !s.is_empty()) {
            let after = parse_time_of_day(after)
                .ok_or_else(|| invalid(format!("invalid after time format: {}", after)))?;
            if time < after {
                return Ok(false);
            }
        }
        if let Some(before) = self.before.as_deref().filter(|s| !s.is_empty()) {
            let before = parse_time_of_day(before)
                .ok_or_else(|| invalid(format!("invalid before time format: {}", before)))?;
            if time > before {
                return Ok(false);
            }
        }

        if !self.weekdays.is_empty() {
            let today = weekday_name(now.weekday());
            if !self.weekdays.iter().any(|d| d.eq_ignore_ascii_case(today)) {
                return Ok(false);
            }
        }

        let date = now.date_naive();
        if let Some(start) = self.start_date.as_deref().filter(|s| !s.is_empty()) {
            if date < parse_date(start, "start_date")? {
                return Ok(false);
            }
        }
        if let Some(end) = self.end_date.as_deref().filter(|s| !s.is_empty()) {
            if date > parse_date(end, "end_date")? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Numeric condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericCondition {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entity_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Strictly greater than
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,

    /// Strictly less than
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<f64>,

    /// Literal value used instead of an entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl NumericCondition {
    pub fn new(id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            entity_id: entity_id.into(),
            attribute: None,
            above: None,
            below: None,
            equals: None,
            not_equals: None,
            value: None,
        }
    }

    pub fn above(mut self, threshold: f64) -> Self {
        self.above = Some(threshold);
        self
    }

    pub fn below(mut self, threshold: f64) -> Self {
        self.below = Some(threshold);
        self
    }
}

/// Template condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateCondition {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub value_template: String,
}

impl TemplateCondition {
    pub fn new(id: impl Into<String>, value_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            value_template: value_template.into(),
        }
    }
}

/// Composite condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeCondition {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub operator: LogicOperator,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CompositeCondition {
    pub fn new(
        id: impl Into<String>,
        operator: LogicOperator,
        conditions: Vec<Condition>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            operator,
            conditions,
        }
    }
}

impl Condition {
    pub fn id(&self) -> &str {
        match self {
            Condition::State(c) => &c.id,
            Condition::Time(c) => &c.id,
            Condition::Numeric(c) => &c.id,
            Condition::Template(c) => &c.id,
            Condition::Composite(c) => &c.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            Condition::State(c) => c.id = id,
            Condition::Time(c) => c.id = id,
            Condition::Numeric(c) => c.id = id,
            Condition::Template(c) => c.id = id,
            Condition::Composite(c) => c.id = id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Condition::State(_) => "state",
            Condition::Time(_) => "time",
            Condition::Numeric(_) => "numeric",
            Condition::Template(_) => "template",
            Condition::Composite(_) => "composite",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Condition::State(c) => c.enabled,
            Condition::Time(c) => c.enabled,
            Condition::Numeric(c) => c.enabled,
            Condition::Template(c) => c.enabled,
            Condition::Composite(c) => c.enabled,
        }
    }

    /// Evaluate the condition
    ///
    /// Disabled conditions are vacuously true.
    pub fn evaluate(&self, data: &Variables) -> ConditionResult<bool> {
        if !self.enabled() {
            return Ok(true);
        }

        let result = match self {
            Condition::State(c) => evaluate_state(c, data),
            Condition::Time(c) => c.matches_at(&Local::now()),
            Condition::Numeric(c) => evaluate_numeric(c, data),
            Condition::Template(c) => evaluate_template(c, data),
            Condition::Composite(c) => {
                let mut results = Vec::with_capacity(c.conditions.len());
                for child in &c.conditions {
                    results.push(child.evaluate(data)?);
                }
                Ok(c.operator.combine(results))
            }
        };

        trace!(
            condition_id = %self.id(),
            condition_type = self.kind(),
            result = ?result.as_ref().ok(),
            "Condition evaluated"
        );
        result
    }

    /// Validate the condition configuration
    pub fn validate(&self) -> ConditionResult<()> {
        if self.id().is_empty() {
            return Err(invalid("condition ID is required"));
        }

        match self {
            Condition::State(c) => {
                if c.entity_id.is_empty() {
                    return Err(invalid("entity_id is required for state condition"));
                }
            }
            Condition::Time(c) => {
                for (field, value) in [("before", &c.before), ("after", &c.after)] {
                    if let Some(v) = value.as_deref().filter(|s| !s.is_empty()) {
                        if parse_time_of_day(v).is_none() {
                            return Err(invalid(format!("invalid {} time format: {}", field, v)));
                        }
                    }
                }
                for (field, value) in [("start_date", &c.start_date), ("end_date", &c.end_date)] {
                    if let Some(v) = value.as_deref().filter(|s| !s.is_empty()) {
                        parse_date(v, field)?;
                    }
                }
            }
            Condition::Numeric(c) => {
                if c.entity_id.is_empty() && c.value.is_none() {
                    return Err(invalid(
                        "either entity_id or value is required for numeric condition",
                    ));
                }
            }
            Condition::Template(c) => {
                if c.value_template.is_empty() {
                    return Err(invalid("value_template is required for template condition"));
                }
            }
            Condition::Composite(c) => {
                if c.conditions.len() < 2 {
                    return Err(invalid(
                        "composite condition must have at least 2 conditions",
                    ));
                }
                for (i, child) in c.conditions.iter().enumerate() {
                    child
                        .validate()
                        .map_err(|e| invalid(format!("condition {}: {}", i, e)))?;
                }
            }
        }
        Ok(())
    }
}

impl From<StateCondition> for Condition {
    fn from(c: StateCondition) -> Self {
        Condition::State(c)
    }
}

impl From<TimeCondition> for Condition {
    fn from(c: TimeCondition) -> Self {
        Condition::Time(c)
    }
}

impl From<NumericCondition> for Condition {
    fn from(c: NumericCondition) -> Self {
        Condition::Numeric(c)
    }
}

impl From<TemplateCondition> for Condition {
    fn from(c: TemplateCondition) -> Self {
        Condition::Template(c)
    }
}

impl From<CompositeCondition> for Condition {
    fn from(c: CompositeCondition) -> Self {
        Condition::Composite(c)
    }
}

// --- Evaluation ---

/// Look up `entity_<id>` and return the state or the named attribute
fn entity_value<'a>(
    data: &'a Variables,
    entity_id: &str,
    attribute: Option<&str>,
) -> ConditionResult<&'a Value> {
    let entity = data
        .get(&format!("entity_{}", entity_id))
        .ok_or_else(|| ConditionError::EntityNotFound(entity_id.to_string()))?;
    let entity = entity
        .as_object()
        .ok_or_else(|| ConditionError::InvalidEntityData(entity_id.to_string()))?;

    match attribute.filter(|a| !a.is_empty()) {
        Some(attribute) => {
            let attributes = entity
                .get("attributes")
                .and_then(Value::as_object)
                .ok_or_else(|| ConditionError::AttributesNotFound(entity_id.to_string()))?;
            Ok(attributes.get(attribute).unwrap_or(&Value::Null))
        }
        None => Ok(entity.get("state").unwrap_or(&Value::Null)),
    }
}

fn evaluate_state(condition: &StateCondition, data: &Variables) -> ConditionResult<bool> {
    let current = entity_value(data, &condition.entity_id, condition.attribute.as_deref())?;
    Ok(condition
        .state
        .as_ref()
        .map(|expected| values_equal(current, expected))
        .unwrap_or(true))
}

fn evaluate_numeric(condition: &NumericCondition, data: &Variables) -> ConditionResult<bool> {
    let value = match &condition.value {
        Some(literal) => {
            as_f64(literal).ok_or_else(|| ConditionError::NotNumeric(display_value(literal)))?
        }
        None => {
            let raw = entity_value(data, &condition.entity_id, condition.attribute.as_deref())?;
            as_f64(raw).ok_or_else(|| ConditionError::NotNumeric(display_value(raw)))?
        }
    };

    if matches!(condition.above, Some(above) if value <= above) {
        return Ok(false);
    }
    if matches!(condition.below, Some(below) if value >= below) {
        return Ok(false);
    }
    if matches!(condition.equals, Some(equals) if value != equals) {
        return Ok(false);
    }
    if matches!(condition.not_equals, Some(not_equals) if value == not_equals) {
        return Ok(false);
    }
    Ok(true)
}

fn evaluate_template(condition: &TemplateCondition, data: &Variables) -> ConditionResult<bool> {
    let rendered = evaluate_simple(&condition.value_template, data)?;
    match rendered.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => other
            .parse::<f64>()
            .map(|n| n != 0.0)
            .map_err(|_| ConditionError::NotBoolean(rendered.clone())),
    }
}

// --- Utility functions ---

fn invalid(message: impl Into<String>) -> ConditionError {
    ConditionError::Invalid(message.into())
}

fn parse_date(s: &str, field: &str) -> ConditionResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| invalid(format!("invalid {} format: {}", field, s)))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_state_condition() {
        let data = vars(json!({
            "entity_sensor.test": {"state": "on", "attributes": {"mode": "eco"}}
        }));

        let on: Condition = StateCondition::new("c", "sensor.test").with_state("on").into();
        assert!(on.evaluate(&data).unwrap());

        let off: Condition = StateCondition::new("c", "sensor.test").with_state("off").into();
        assert!(!off.evaluate(&data).unwrap());

        let exists: Condition = StateCondition::new("c", "sensor.test").into();
        assert!(exists.evaluate(&data).unwrap());

        let attr: Condition = StateCondition::new("c", "sensor.test")
            .with_attribute("mode")
            .with_state("eco")
            .into();
        assert!(attr.evaluate(&data).unwrap());
    }

    #[test]
    fn test_state_condition_missing_entity_is_error() {
        let data = vars(json!({"entity_sensor.other": {"state": "on"}}));
        let condition: Condition = StateCondition::new("c", "sensor.test").with_state("on").into();
        let err = condition.evaluate(&data).unwrap_err();
        assert_eq!(err.to_string(), "entity sensor.test not found in context");

        let attr: Condition = StateCondition::new("c", "sensor.other")
            .with_attribute("mode")
            .into();
        assert!(matches!(
            attr.evaluate(&data),
            Err(ConditionError::AttributesNotFound(_))
        ));
    }

    #[test]
    fn test_disabled_condition_is_true() {
        let mut condition = StateCondition::new("c", "sensor.missing").with_state("on");
        condition.enabled = false;
        assert!(Condition::from(condition).evaluate(&Variables::new()).unwrap());
    }

    #[test]
    fn test_numeric_boundaries() {
        let above: Condition = NumericCondition::new("c", "sensor.temp").above(20.0).into();

        let at = vars(json!({"entity_sensor.temp": {"state": 20.0}}));
        assert!(!above.evaluate(&at).unwrap());

        let over = vars(json!({"entity_sensor.temp": {"state": "20.01"}}));
        assert!(above.evaluate(&over).unwrap());

        let below: Condition = NumericCondition::new("c", "sensor.temp").below(20.0).into();
        assert!(!below.evaluate(&at).unwrap());
    }

    #[test]
    fn test_numeric_literal_and_errors() {
        let mut literal = NumericCondition::new("c", "");
        literal.value = Some(json!(5));
        literal.equals = Some(5.0);
        assert!(Condition::from(literal.clone()).evaluate(&Variables::new()).unwrap());

        literal.not_equals = Some(5.0);
        assert!(!Condition::from(literal).evaluate(&Variables::new()).unwrap());

        let condition: Condition = NumericCondition::new("c", "sensor.temp").above(1.0).into();
        let data = vars(json!({"entity_sensor.temp": {"state": "unavailable"}}));
        assert!(matches!(
            condition.evaluate(&data),
            Err(ConditionError::NotNumeric(_))
        ));
    }

    #[test]
    fn test_template_condition() {
        let data = vars(json!({"flag": true, "count": 3, "zero": 0, "word": "maybe"}));
        let eval = |t: &str| Condition::from(TemplateCondition::new("c", t)).evaluate(&data);

        assert!(eval("{{ flag }}").unwrap());
        assert!(eval("{{ count }}").unwrap());
        assert!(!eval("{{ zero }}").unwrap());
        assert!(!eval("false").unwrap());
        assert!(matches!(eval("{{ word }}"), Err(ConditionError::NotBoolean(_))));
        assert!(eval("{{ missing }}").is_err());
    }

    #[test]
    fn test_time_condition_window_weekday_and_dates() {
        // 2024-06-05 was a Wednesday
        let now = Utc.with_ymd_and_hms(2024, 6, 5, 14, 30, 0).unwrap();

        let mut window = TimeCondition::new("c");
        window.after = Some("08:00".to_string());
        window.before = Some("18:00:00".to_string());
        assert!(window.matches_at(&now).unwrap());

        window.before = Some("12:00".to_string());
        assert!(!window.matches_at(&now).unwrap());

        let mut days = TimeCondition::new("c");
        days.weekdays = vec!["mon".to_string(), "Wed".to_string()];
        assert!(days.matches_at(&now).unwrap());
        days.weekdays = vec!["sat".to_string(), "sun".to_string()];
        assert!(!days.matches_at(&now).unwrap());

        let mut dates = TimeCondition::new("c");
        dates.start_date = Some("2024-06-01".to_string());
        dates.end_date = Some("2024-06-05".to_string());
        assert!(dates.matches_at(&now).unwrap());
        dates.end_date = Some("2024-06-04".to_string());
        assert!(!dates.matches_at(&now).unwrap());
    }

    #[test]
    fn test_time_window_does_not_wrap_midnight() {
        let late = Utc.with_ymd_and_hms(2024, 6, 5, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 6, 5, 5, 0, 0).unwrap();

        let mut night = TimeCondition::new("c");
        night.after = Some("22:00".to_string());
        night.before = Some("06:00".to_string());
        assert!(!night.matches_at(&late).unwrap());
        assert!(!night.matches_at(&early).unwrap());
    }

    #[test]
    fn test_composite_condition() {
        let data = vars(json!({
            "entity_sensor.a": {"state": "on"},
            "entity_sensor.b": {"state": "off"}
        }));
        let children: Vec<Condition> = vec![
            StateCondition::new("a", "sensor.a").with_state("on").into(),
            StateCondition::new("b", "sensor.b").with_state("on").into(),
        ];

        let and: Condition =
            CompositeCondition::new("c", LogicOperator::And, children.clone()).into();
        assert!(!and.evaluate(&data).unwrap());

        let or: Condition = CompositeCondition::new("c", LogicOperator::Or, children).into();
        assert!(or.evaluate(&data).unwrap());

        let failing: Condition = CompositeCondition::new(
            "c",
            LogicOperator::Or,
            vec![
                StateCondition::new("a", "sensor.a").with_state("on").into(),
                StateCondition::new("m", "sensor.missing").into(),
            ],
        )
        .into();
        assert!(failing.evaluate(&data).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Condition::from(StateCondition::new("", "sensor.a")).validate().is_err());
        assert!(Condition::from(NumericCondition::new("c", "")).validate().is_err());
        assert!(Condition::from(TemplateCondition::new("c", "")).validate().is_err());

        let mut time = TimeCondition::new("c");
        time.start_date = Some("06/01/2024".to_string());
        let err = Condition::from(time).validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid start_date format: 06/01/2024");

        let composite: Condition = CompositeCondition::new(
            "c",
            LogicOperator::And,
            vec![TemplateCondition::new("t", "true").into()],
        )
        .into();
        assert!(composite.validate().is_err());
    }
}
