//! Loose comparisons over JSON values
//!
//! Rule documents are written by hand, so `to: 1` in YAML and a state of
//! `"1"` coming from a device must compare equal. Everything here works on the
//! display form of a value rather than its JSON type.

use serde_json::Value;

/// Render a value the way it reads in a rule document
///
/// Strings are rendered without quotes and whole floats without a fraction,
/// so `20.0` and `20` render the same.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                return n.to_string();
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
                Some(f) => f.to_string(),
                None => n.to_string(),
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Compare two values by their display form
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    display_value(actual) == display_value(expected)
}

/// Coerce a value to a number
///
/// Accepts JSON numbers and numeric strings; everything else is `None`.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
