//! Placeholder substitution
//!
//! Two flavours are used by the engine:
//!
//! - [`render_string`] replaces the literal `{{ key }}` form for every
//!   top-level variable. Actions use it for titles, payloads, URLs.
//! - [`evaluate_simple`] resolves `{{ a.b.c }}` paths into nested maps.
//!   Template conditions use it.
//!
//! Neither is a template language; there are no filters or expressions.

use ha_core::value::display_value;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::Variables;

const PLACEHOLDER: &str = r"\{\{\s*([^}]+)\s*\}\}";

/// Compiled once; a compile error is cached and returned to every caller
fn placeholder_regex() -> Result<&'static Regex, regex::Error> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER))
        .as_ref()
        .map_err(Clone::clone)
}

/// Replace `{{ key }}` with the display form of each top-level variable
///
/// Unknown placeholders are left untouched.
pub fn render_string(template: &str, variables: &Variables) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let mut result = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{{ {} }}}}", key);
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, &display_value(value));
        }
    }
    result
}

/// Render every string inside a JSON value, recursing through maps and lists
pub fn render_value(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(s) => Value::String(render_string(s, variables)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, variables)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_value(v, variables)).collect())
        }
        other => other.clone(),
    }
}

/// Substitute `{{ path }}` placeholders using dotted lookups
///
/// A missing path renders as `null`.
pub fn evaluate_simple(template: &str, variables: &Variables) -> Result<String, regex::Error> {
    let rendered = placeholder_regex()?
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            display_value(&lookup_path(variables, path))
        })
        .into_owned();
    Ok(rendered)
}

/// Resolve a dotted path such as `trigger_event.new_state`
///
/// Walking stops at the first non-map value, which is returned as is.
pub fn lookup_path(variables: &Variables, path: &str) -> Value {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Value::Null;
    };
    let Some(mut current) = variables.get(first) else {
        return Value::Null;
    };

    for part in parts {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return current.clone(),
        }
    }
    current.clone()
}
