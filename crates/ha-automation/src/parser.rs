//! Rule document parsing
//!
//! Accepts two dialects that may be mixed within one document:
//!
//! - **native**: every trigger, condition and action carries a `type` tag and
//!   the full field set of its variant.
//! - **hub-style**: triggers keyed by `platform`, conditions by `condition`,
//!   actions by `service` or `delay`, as found in existing home automation
//!   configurations.
//!
//! Items without an `id` get one synthesized from their position
//! (`trigger_0`, `condition_1`, `action_2`, nested `<parent>_sub_<i>`).

use ha_core::events;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::action::{Action, DelayAction, ServiceAction};
use crate::condition::{
    CompositeCondition, Condition, NumericCondition, StateCondition, TemplateCondition,
    TimeCondition,
};
use crate::rule::{ExecutionMode, Rule, ValidationError, ValidationResult};
use crate::trigger::{
    EventTrigger, LogicOperator, StateTrigger, TimeTrigger, Trigger, WebhookTrigger,
};

/// Rule parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule document must be an object")]
    NotAnObject,

    #[error("rule {0} is required")]
    MissingField(&'static str),

    #[error("invalid execution mode: {0}")]
    InvalidMode(String),

    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("failed to parse {section}: {message}")]
    Section {
        section: &'static str,
        message: String,
    },
}

/// Result type for parsing
pub type ParseResult<T> = Result<T, ParseError>;

/// Input document format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Json,
    Yaml,
}

impl RuleFormat {
    /// `yaml`, `yml` or `json`, case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(RuleFormat::Json),
            "yaml" | "yml" => Some(RuleFormat::Yaml),
            _ => None,
        }
    }
}

/// Parses and serializes rule documents
#[derive(Debug, Default, Clone)]
pub struct RuleParser;

impl RuleParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_json(&self, input: &str) -> ParseResult<Rule> {
        let raw: Value = serde_json::from_str(input)?;
        self.parse_value(raw)
    }

    pub fn parse_yaml(&self, input: &str) -> ParseResult<Rule> {
        let raw: Value = serde_yaml::from_str(input)?;
        self.parse_value(raw)
    }

    /// Parse an already decoded document
    pub fn parse_value(&self, raw: Value) -> ParseResult<Rule> {
        let Value::Object(mut doc) = raw else {
            return Err(ParseError::NotAnObject);
        };

        let name = match doc.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => return Err(ParseError::MissingField("name")),
        };
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut rule = Rule::new(id, name);
        if let Some(description) = doc.get("description").and_then(Value::as_str) {
            rule.description = description.to_string();
        }
        if let Some(enabled) = doc.get("enabled").and_then(Value::as_bool) {
            rule.enabled = enabled;
        }
        if let Some(mode) = doc.get("mode").and_then(Value::as_str) {
            rule.mode = mode
                .parse::<ExecutionMode>()
                .map_err(|_| ParseError::InvalidMode(mode.to_string()))?;
        }
        if let Some(Value::Object(variables)) = doc.remove("variables") {
            rule.variables = variables.into_iter().collect::<HashMap<_, _>>();
        }
        if let Some(priority) = doc.get("priority").filter(|v| !v.is_null()) {
            rule.priority = priority
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| ParseError::InvalidField {
                    field: "priority",
                    message: format!("{} is not a 32-bit integer", priority),
                })?;
        }
        if let Some(Value::Array(tags)) = doc.get("tags") {
            rule.tags = tags
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(category) = doc.get("category").and_then(Value::as_str) {
            rule.category = category.to_string();
        }

        let triggers = doc
            .remove("triggers")
            .ok_or(ParseError::MissingField("triggers"))?;
        rule.triggers = parse_list(triggers, "trigger", parse_trigger).map_err(|message| {
            ParseError::Section {
                section: "triggers",
                message,
            }
        })?;

        if let Some(conditions) = doc.remove("conditions") {
            rule.conditions =
                parse_list(conditions, "condition", parse_condition).map_err(|message| {
                    ParseError::Section {
                        section: "conditions",
                        message,
                    }
                })?;
        }

        let actions = doc
            .remove("actions")
            .ok_or(ParseError::MissingField("actions"))?;
        rule.actions = parse_list(actions, "action", parse_action).map_err(|message| {
            ParseError::Section {
                section: "actions",
                message,
            }
        })?;

        debug!(
            rule_id = %rule.id,
            triggers = rule.triggers.len(),
            conditions = rule.conditions.len(),
            actions = rule.actions.len(),
            "Parsed rule"
        );
        Ok(rule)
    }

    /// Pretty-printed JSON in the native dialect
    pub fn serialize_to_json(&self, rule: &Rule) -> ParseResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_document(rule)?)?)
    }

    /// YAML in the native dialect
    pub fn serialize_to_yaml(&self, rule: &Rule) -> ParseResult<String> {
        Ok(serde_yaml::to_string(&self.to_document(rule)?)?)
    }

    /// Check a document without registering it
    ///
    /// Errors are keyed `format`, `syntax`, `mode` or `structure` before the
    /// full rule validation runs.
    pub fn validate_rule_syntax(&self, input: &str, format: &str) -> ValidationResult {
        let Some(format) = RuleFormat::from_name(format) else {
            return single_error("format", "unsupported format, use 'yaml' or 'json'");
        };

        let raw: Result<Value, String> = match format {
            RuleFormat::Json => serde_json::from_str(input).map_err(|e| e.to_string()),
            RuleFormat::Yaml => serde_yaml::from_str(input).map_err(|e| e.to_string()),
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => return single_error("syntax", format!("parse error: {}", e)),
        };

        match self.parse_value(raw) {
            Ok(rule) => rule.validate(),
            Err(e @ ParseError::InvalidMode(_)) => single_error("mode", e.to_string()),
            Err(ParseError::InvalidField { field, message }) => {
                single_error(field, format!("invalid {}: {}", field, message))
            }
            Err(e) => single_error("structure", e.to_string()),
        }
    }

    fn to_document(&self, rule: &Rule) -> ParseResult<Value> {
        let mut doc = Map::new();
        doc.insert("id".into(), json!(rule.id));
        doc.insert("name".into(), json!(rule.name));
        doc.insert("description".into(), json!(rule.description));
        doc.insert("enabled".into(), json!(rule.enabled));
        doc.insert("mode".into(), json!(rule.mode.as_str()));

        if !rule.variables.is_empty() {
            doc.insert("variables".into(), serde_json::to_value(&rule.variables)?);
        }
        if rule.priority != 0 {
            doc.insert("priority".into(), json!(rule.priority));
        }
        if !rule.tags.is_empty() {
            doc.insert("tags".into(), json!(rule.tags));
        }
        if !rule.category.is_empty() {
            doc.insert("category".into(), json!(rule.category));
        }

        doc.insert("triggers".into(), serde_json::to_value(&rule.triggers)?);
        if !rule.conditions.is_empty() {
            doc.insert("conditions".into(), serde_json::to_value(&rule.conditions)?);
        }
        doc.insert("actions".into(), serde_json::to_value(&rule.actions)?);
        Ok(Value::Object(doc))
    }
}

fn single_error(field: &str, message: impl Into<String>) -> ValidationResult {
    ValidationResult {
        valid: false,
        errors: vec![ValidationError::new(field, message)],
    }
}

// --- Item parsing ---

type ItemResult<T> = Result<T, String>;

/// Parse an array of items, synthesizing `<prefix>_<i>` ids
fn parse_list<T>(
    value: Value,
    prefix: &str,
    parse_item: fn(Map<String, Value>) -> ItemResult<T>,
) -> ItemResult<Vec<T>> {
    let Value::Array(items) = value else {
        return Err(format!("{}s must be an array", prefix));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let Value::Object(mut map) = item else {
                return Err(format!("{} {} must be an object", prefix, i));
            };
            map.entry("id")
                .or_insert_with(|| Value::String(format!("{}_{}", prefix, i)));
            parse_item(map).map_err(|e| format!("{} {}: {}", prefix, i, e))
        })
        .collect()
}

/// Parse nested children, synthesizing `<parent>_<infix>_<i>` ids
fn parse_children<T>(
    value: Option<Value>,
    parent_id: &str,
    infix: &str,
    parse_item: fn(Map<String, Value>) -> ItemResult<T>,
) -> ItemResult<Vec<T>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err("nested items must be an array".to_string());
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let Value::Object(mut map) = item else {
                return Err(format!("sub-item {} must be an object", i));
            };
            map.entry("id")
                .or_insert_with(|| Value::String(format!("{}_{}_{}", parent_id, infix, i)));
            parse_item(map).map_err(|e| format!("sub-item {}: {}", i, e))
        })
        .collect()
}

fn item_id(map: &Map<String, Value>) -> String {
    map.get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Numeric threshold given as a number or a numeric string
fn threshold(map: &Map<String, Value>, key: &str) -> ItemResult<Option<f64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("{} must be numeric, got {:?}", key, s)),
        Some(other) => Err(format!("{} must be numeric, got {}", key, other)),
    }
}

fn required_str(map: &Map<String, Value>, key: &str, what: &str) -> ItemResult<String> {
    str_field(map, key).ok_or_else(|| format!("{} is required for {}", key, what))
}

fn parse_trigger(mut map: Map<String, Value>) -> ItemResult<Trigger> {
    if map.contains_key("type") {
        let nested = if map.get("type").and_then(Value::as_str) == Some("composite") {
            let id = item_id(&map);
            Some(parse_children(map.remove("triggers"), &id, "sub", parse_trigger)?)
        } else {
            None
        };
        let mut trigger: Trigger =
            serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())?;
        if let (Trigger::Composite(composite), Some(children)) = (&mut trigger, nested) {
            composite.triggers = children;
        }
        return Ok(trigger);
    }

    match str_field(&map, "platform") {
        Some(platform) => parse_hub_trigger(&platform, &map),
        None => Err("trigger must have either 'platform' or 'type' field".to_string()),
    }
}

fn parse_hub_trigger(platform: &str, map: &Map<String, Value>) -> ItemResult<Trigger> {
    let mut id = item_id(map);
    if id.is_empty() {
        id = format!("ha_{}_trigger", platform);
    }

    match platform {
        "state" => {
            let entity_id = required_str(map, "entity_id", "state trigger")?;
            let mut trigger = StateTrigger::new(id, entity_id);
            trigger.from = map.get("from").cloned();
            trigger.to = map.get("to").cloned();
            Ok(trigger.into())
        }
        "time" => {
            let mut trigger = TimeTrigger::new(id);
            trigger.at = str_field(map, "at");
            Ok(trigger.into())
        }
        "sun" => {
            let event = required_str(map, "event", "sun trigger")?;
            let mut trigger =
                EventTrigger::new(id, events::SUN_EVENT).with_data("event", Value::String(event));
            if let Some(offset) = str_field(map, "offset") {
                trigger = trigger.with_data("offset", Value::String(offset));
            }
            Ok(trigger.into())
        }
        "webhook" => {
            let webhook_id = required_str(map, "webhook_id", "webhook trigger")?;
            let mut trigger = WebhookTrigger::new(id, webhook_id);
            if let Some(method) = str_field(map, "method") {
                trigger.method = method;
            }
            Ok(trigger.into())
        }
        other => Err(format!("unsupported platform: {}", other)),
    }
}

fn parse_condition(mut map: Map<String, Value>) -> ItemResult<Condition> {
    if map.contains_key("type") {
        let nested = if map.get("type").and_then(Value::as_str) == Some("composite") {
            let id = item_id(&map);
            Some(parse_children(map.remove("conditions"), &id, "sub", parse_condition)?)
        } else {
            None
        };
        let mut condition: Condition =
            serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())?;
        if let (Condition::Composite(composite), Some(children)) = (&mut condition, nested) {
            composite.conditions = children;
        }
        return Ok(condition);
    }

    match str_field(&map, "condition") {
        Some(kind) => parse_hub_condition(&kind, map),
        None => Err("condition must have either 'condition' or 'type' field".to_string()),
    }
}

fn parse_hub_condition(kind: &str, mut map: Map<String, Value>) -> ItemResult<Condition> {
    let mut id = item_id(&map);
    if id.is_empty() {
        id = format!("ha_{}_condition", kind);
    }

    match kind {
        "state" => {
            let entity_id = required_str(&map, "entity_id", "state condition")?;
            let mut condition = StateCondition::new(id, entity_id);
            condition.state = map.get("state").cloned();
            condition.attribute = str_field(&map, "attribute");
            Ok(condition.into())
        }
        "time" => {
            let mut condition = TimeCondition::new(id);
            condition.before = str_field(&map, "before");
            condition.after = str_field(&map, "after");
            if let Some(Value::Array(days)) = map.get("weekday") {
                condition.weekdays = days
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
            Ok(condition.into())
        }
        "numeric_state" => {
            let entity_id = required_str(&map, "entity_id", "numeric_state condition")?;
            let mut condition = NumericCondition::new(id, entity_id);
            condition.above = threshold(&map, "above")?;
            condition.below = threshold(&map, "below")?;
            condition.attribute = str_field(&map, "attribute");
            Ok(condition.into())
        }
        "template" => {
            let template = required_str(&map, "value_template", "template condition")?;
            Ok(TemplateCondition::new(id, template).into())
        }
        "and" | "or" => {
            let operator = if kind == "and" {
                LogicOperator::And
            } else {
                LogicOperator::Or
            };
            let children = match map.remove("conditions") {
                Some(children @ Value::Array(_)) => {
                    parse_children(Some(children), &id, "sub", parse_condition)?
                }
                _ => return Err(format!("conditions are required for '{}' condition", kind)),
            };
            Ok(CompositeCondition::new(id, operator, children).into())
        }
        other => Err(format!("unsupported condition type: {}", other)),
    }
}

fn parse_action(mut map: Map<String, Value>) -> ItemResult<Action> {
    if map.contains_key("type") {
        let nested = if map.get("type").and_then(Value::as_str) == Some("conditional") {
            let id = item_id(&map);
            Some((
                parse_children(map.remove("conditions"), &id, "sub", parse_condition)?,
                parse_children(map.remove("then_actions"), &id, "then", parse_action)?,
                parse_children(map.remove("else_actions"), &id, "else", parse_action)?,
            ))
        } else {
            None
        };
        let mut action: Action =
            serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())?;
        if let (Action::Conditional(conditional), Some((conditions, then_actions, else_actions))) =
            (&mut action, nested)
        {
            conditional.conditions = conditions;
            conditional.then_actions = then_actions;
            conditional.else_actions = else_actions;
        }
        return Ok(action);
    }

    if map.contains_key("service") {
        return parse_hub_service(&map);
    }
    if map.contains_key("delay") {
        return parse_hub_delay(&map);
    }
    Err("action must have 'service', 'type', or 'delay' field".to_string())
}

fn parse_hub_service(map: &Map<String, Value>) -> ItemResult<Action> {
    let service = required_str(map, "service", "service action")?;
    let mut id = item_id(map);
    if id.is_empty() {
        id = format!("service_{}", service.replace('.', "_"));
    }

    let mut action = ServiceAction::new(id, service);
    action.entity_id = str_field(map, "entity_id");
    if let Some(Value::Object(data)) = map.get("data") {
        action.data = data.clone();
    }
    if let Some(target @ Value::Object(_)) = map.get("target") {
        action.target = Some(target.clone());
    }
    Ok(action.into())
}

fn parse_hub_delay(map: &Map<String, Value>) -> ItemResult<Action> {
    let mut id = item_id(map);
    if id.is_empty() {
        id = "delay_action".to_string();
    }

    let duration = match map.get("delay") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(parts)) => delay_from_parts(parts),
        _ => return Err("invalid delay format".to_string()),
    };
    Ok(DelayAction::new(id, duration).into())
}

/// `{hours: 1, minutes: 30}` becomes `"1h30m"`; nothing positive becomes `"1s"`
fn delay_from_parts(parts: &Map<String, Value>) -> String {
    let mut duration = String::new();
    for (key, unit) in [("hours", "h"), ("minutes", "m"), ("seconds", "s")] {
        if let Some(n) = parts.get(key).and_then(Value::as_f64).filter(|n| *n > 0.0) {
            duration.push_str(&format!("{:.0}{}", n, unit));
        }
    }
    if duration.is_empty() {
        duration.push_str("1s");
    }
    duration
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB_YAML: &str = r#"
name: Evening lights
mode: parallel
triggers:
  - platform: state
    entity_id: binary_sensor.motion
    from: "off"
    to: "on"
  - platform: sun
    event: sunset
    offset: "-00:30:00"
conditions:
  - condition: numeric_state
    entity_id: sensor.lux
    below: 50
  - condition: or
    conditions:
      - condition: state
        entity_id: input_boolean.guest
        state: "on"
      - condition: template
        value_template: "{{ flag }}"
actions:
  - service: light.turn_on
    entity_id: light.hall
    data:
      brightness: 200
  - delay:
      hours: 1
      minutes: 30
  - delay: 5s
"#;

    #[test]
    fn test_parse_hub_yaml() {
        let rule = RuleParser::new().parse_yaml(HUB_YAML).unwrap();
        assert_eq!(rule.name, "Evening lights");
        assert!(rule.enabled);
        assert_eq!(rule.mode, ExecutionMode::Parallel);

        assert_eq!(rule.triggers.len(), 2);
        assert_eq!(rule.triggers[0].id(), "trigger_0");
        assert_eq!(rule.triggers[0].kind(), "state");
        match &rule.triggers[1] {
            Trigger::Event(t) => {
                assert_eq!(t.event_type, "sun_event");
                let data = t.event_data.as_ref().unwrap();
                assert_eq!(data.get("event"), Some(&json!("sunset")));
                assert_eq!(data.get("offset"), Some(&json!("-00:30:00")));
            }
            other => panic!("expected event trigger, got {:?}", other),
        }

        assert_eq!(rule.conditions.len(), 2);
        match &rule.conditions[1] {
            Condition::Composite(c) => {
                assert_eq!(c.operator, LogicOperator::Or);
                assert_eq!(c.conditions[0].id(), "condition_1_sub_0");
                assert_eq!(c.conditions[1].kind(), "template");
            }
            other => panic!("expected composite condition, got {:?}", other),
        }

        assert_eq!(rule.actions.len(), 3);
        match (&rule.actions[1], &rule.actions[2]) {
            (Action::Delay(a), Action::Delay(b)) => {
                assert_eq!(a.duration, "1h30m");
                assert_eq!(b.duration, "5s");
            }
            other => panic!("expected delays, got {:?}", other),
        }
        assert!(rule.validate().errors.iter().all(|e| e.field == "id"));
    }

    #[test]
    fn test_hub_fallback_ids() {
        let rule = RuleParser::new()
            .parse_value(json!({
                "name": "r",
                "triggers": [{"id": "", "platform": "webhook", "webhook_id": "door"}],
                "conditions": [{"id": "", "condition": "time", "after": "08:00"}],
                "actions": [
                    {"id": "", "service": "light.turn_off"},
                    {"id": "", "delay": {}}
                ]
            }))
            .unwrap();
        assert_eq!(rule.triggers[0].id(), "ha_webhook_trigger");
        assert_eq!(rule.conditions[0].id(), "ha_time_condition");
        assert_eq!(rule.actions[0].id(), "service_light_turn_off");
        assert_eq!(rule.actions[1].id(), "delay_action");
        match &rule.actions[1] {
            Action::Delay(d) => assert_eq!(d.duration, "1s"),
            other => panic!("expected delay, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_native_json_with_nesting() {
        let input = json!({
            "id": "r1",
            "name": "Native",
            "triggers": [{
                "type": "composite",
                "operator": "or",
                "triggers": [
                    {"type": "state", "entity_id": "sensor.a", "to": "on"},
                    {"platform": "state", "entity_id": "sensor.b"}
                ]
            }],
            "actions": [{
                "type": "conditional",
                "conditions": [{"type": "template", "value_template": "true"}],
                "then_actions": [{"type": "variable", "variable": "x", "value": 1}],
                "else_actions": [{"service": "light.toggle"}]
            }]
        })
        .to_string();

        let rule = RuleParser::new().parse_json(&input).unwrap();
        match &rule.triggers[0] {
            Trigger::Composite(c) => {
                assert_eq!(c.id, "trigger_0");
                assert_eq!(c.triggers[0].id(), "trigger_0_sub_0");
                assert_eq!(c.triggers[1].id(), "trigger_0_sub_1");
            }
            other => panic!("expected composite, got {:?}", other),
        }
        match &rule.actions[0] {
            Action::Conditional(a) => {
                assert_eq!(a.conditions[0].id(), "action_0_sub_0");
                assert_eq!(a.then_actions[0].id(), "action_0_then_0");
                assert_eq!(a.else_actions[0].id(), "action_0_else_0");
            }
            other => panic!("expected conditional, got {:?}", other),
        }
        assert!(rule.validate().valid, "{:?}", rule.validate().errors);
    }

    #[test]
    fn test_missing_required_fields() {
        let parser = RuleParser::new();
        assert!(matches!(
            parser.parse_value(json!({"triggers": [], "actions": []})),
            Err(ParseError::MissingField("name"))
        ));
        assert!(matches!(
            parser.parse_value(json!({"name": "r", "actions": []})),
            Err(ParseError::MissingField("triggers"))
        ));
        assert!(matches!(
            parser.parse_value(json!({"name": "r", "triggers": []})),
            Err(ParseError::MissingField("actions"))
        ));
        assert!(matches!(
            parser.parse_value(json!({"name": "r", "triggers": [{"entity_id": "x"}], "actions": []})),
            Err(ParseError::Section { section: "triggers", .. })
        ));
    }

    #[test]
    fn test_invalid_mode() {
        let result = RuleParser::new().parse_value(json!({
            "name": "r", "mode": "restart", "triggers": [], "actions": []
        }));
        assert!(matches!(result, Err(ParseError::InvalidMode(m)) if m == "restart"));
    }

    #[test]
    fn test_priority_out_of_range() {
        let parser = RuleParser::new();
        let doc = |priority: Value| {
            json!({
                "name": "r",
                "priority": priority,
                "triggers": [{"platform": "state", "entity_id": "sensor.a"}],
                "actions": [{"service": "light.turn_on"}]
            })
        };

        assert_eq!(parser.parse_value(doc(json!(-7))).unwrap().priority, -7);
        assert!(matches!(
            parser.parse_value(doc(json!(4_294_967_296_i64))),
            Err(ParseError::InvalidField { field: "priority", .. })
        ));
        assert!(parser.parse_value(doc(json!("high"))).is_err());

        let result = parser.validate_rule_syntax(&doc(json!(i64::MAX)).to_string(), "json");
        assert!(result.has_error_for("priority"));
    }

    #[test]
    fn test_hub_numeric_state_string_thresholds() {
        let parser = RuleParser::new();
        let doc = |above: Value| {
            json!({
                "name": "r",
                "triggers": [{"platform": "state", "entity_id": "sensor.temp"}],
                "conditions": [
                    {"condition": "numeric_state", "entity_id": "sensor.temp", "above": above, "below": 30}
                ],
                "actions": [{"service": "fan.turn_on"}]
            })
        };

        let rule = parser.parse_value(doc(json!("20.5"))).unwrap();
        match &rule.conditions[0] {
            Condition::Numeric(n) => {
                assert_eq!(n.above, Some(20.5));
                assert_eq!(n.below, Some(30.0));
            }
            other => panic!("expected numeric condition, got {:?}", other),
        }

        assert!(matches!(
            parser.parse_value(doc(json!("warm"))),
            Err(ParseError::Section { section: "conditions", .. })
        ));
    }

    #[test]
    fn test_round_trip_native() {
        let parser = RuleParser::new();
        let original = parser.parse_yaml(HUB_YAML).unwrap();

        let json = parser.serialize_to_json(&original).unwrap();
        let from_json = parser.parse_json(&json).unwrap();
        let yaml = parser.serialize_to_yaml(&original).unwrap();
        let from_yaml = parser.parse_yaml(&yaml).unwrap();

        for parsed in [&from_json, &from_yaml] {
            assert_eq!(parsed.mode, original.mode);
            assert_eq!(parsed.triggers.len(), original.triggers.len());
            assert_eq!(parsed.conditions.len(), original.conditions.len());
            assert_eq!(parsed.actions.len(), original.actions.len());
            for (a, b) in parsed.triggers.iter().zip(&original.triggers) {
                assert_eq!(a.kind(), b.kind());
                assert_eq!(a.id(), b.id());
            }
            for (a, b) in parsed.conditions.iter().zip(&original.conditions) {
                assert_eq!(a, b);
            }
            assert_eq!(parsed.actions, original.actions);
        }
    }

    #[test]
    fn test_validate_rule_syntax() {
        let parser = RuleParser::new();

        let result = parser.validate_rule_syntax("{}", "toml");
        assert!(result.has_error_for("format"));

        let result = parser.validate_rule_syntax("{not json", "json");
        assert!(result.has_error_for("syntax"));

        let result = parser.validate_rule_syntax("name: r\ntriggers: []\nactions: []\nmode: x", "YML");
        assert!(result.has_error_for("mode"));

        let result = parser.validate_rule_syntax(r#"{"name": "r"}"#, "json");
        assert!(result.has_error_for("structure"));

        let result = parser.validate_rule_syntax("name: r\ntriggers: []\nactions: []", "yaml");
        assert!(!result.valid);
        assert!(result.has_error_for("triggers"));
        assert!(result.has_error_for("actions"));
    }
}
