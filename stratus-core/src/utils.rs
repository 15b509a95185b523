//! Shared helpers for template value trees.

use serde_json::Value;

/// String forms that count as false when evaluating template conditions.
pub const FALSE_STRINGS: &[&str] = &["0", "false", "False", "FALSE"];

/// Placeholder produced by `Ref: AWS::NoValue`; stripped from containers
/// before values reach a backing service.
pub const PLACEHOLDER_NO_VALUE: &str = "__stratus_no_value__";

/// Render a value the way string-context intrinsics (`Fn::Join`, `Fn::Sub`,
/// `Fn::Equals`) see it: strings verbatim, everything else as its JSON token.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Condition truthiness: `false`, `null`, empty strings and containers, and
/// the [`FALSE_STRINGS`] set are all false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty() && !FALSE_STRINGS.contains(&s.as_str()),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

pub fn is_no_value(value: &Value) -> bool {
    value.as_str() == Some(PLACEHOLDER_NO_VALUE)
}

/// Recursively drop nulls and `AWS::NoValue` placeholders from containers.
/// Backing services usually reject explicit nulls.
pub fn remove_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null() && !is_no_value(v))
                .map(|(k, v)| (k.clone(), remove_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| !v.is_null() && !is_no_value(v))
                .map(remove_nulls)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// `PhysicalResourceId` -> `physicalResourceId`, for attribute lookups that
/// tolerate either casing.
pub fn first_char_to_lower(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
