//! Check input values against the OpenAPI schemas published in process descriptions.
//!
//! Only the keywords the schema deriver and [FieldMeta](crate::FieldMeta) produce are
//! enforced. `oneOf` accepts a value matching any arm, since serde decides between
//! overlapping untagged variants on its own.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::FieldError;

/// Append an error to `errors` for every part of `value` that `schema` rejects. `path`
/// names the value in the errors, and nested locations extend it as `path.key` and
/// `path[index]`.
pub(crate) fn check_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let Value::Object(schema) = schema else {
        return;
    };

    if value.is_null() {
        let allowed = schema.get("nullable") == Some(&Value::Bool(true))
            || !schema.contains_key("type")
            || schema
                .get("enum")
                .and_then(Value::as_array)
                .is_some_and(|allowed| allowed.contains(value));
        if !allowed {
            errors.push(FieldError::new(path, "value must not be null"));
        }
        return;
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !has_type(value, expected) {
            errors.push(FieldError::new(path, format!("expected {expected}, found {value}")));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(FieldError::new(
                path,
                format!("value {value} is not one of {}", Value::Array(allowed.clone())),
            ));
        }
    }

    check_bounds(schema, value, path, errors);

    match value {
        Value::Array(items) => check_items(schema, items, path, errors),
        Value::Object(object) => check_properties(schema, object, path, errors),
        _ => {}
    }

    if let Some(arms) = schema.get("oneOf").and_then(Value::as_array) {
        let matched = arms.iter().any(|arm| {
            let mut scratch = Vec::new();
            check_value(arm, value, path, &mut scratch);
            scratch.is_empty()
        });
        if !matched {
            errors.push(FieldError::new(path, "value matches none of the allowed variants"));
        }
    }

    if let Some(arms) = schema.get("allOf").and_then(Value::as_array) {
        for arm in arms {
            check_value(arm, value, path, errors);
        }
    }
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn violation(path: &str, value: &Value, keyword: &str, bound: &Value) -> FieldError {
    FieldError::new(path, format!("value {value} violates {keyword} {bound}"))
}

fn check_bounds(schema: &Map<String, Value>, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    // OpenAPI 3.0 spells exclusive bounds as booleans modifying minimum/maximum, JSON Schema
    // as numbers of their own. Both forms are accepted.
    let exclusive = |keyword: &str| schema.get(keyword) == Some(&Value::Bool(true));

    for (keyword, bound) in schema {
        let numbers = value.as_f64().zip(bound.as_f64());
        let violated = match keyword.as_str() {
            "minimum" if exclusive("exclusiveMinimum") => numbers.is_some_and(|(v, b)| v <= b),
            "minimum" => numbers.is_some_and(|(v, b)| v < b),
            "maximum" if exclusive("exclusiveMaximum") => numbers.is_some_and(|(v, b)| v >= b),
            "maximum" => numbers.is_some_and(|(v, b)| v > b),
            "exclusiveMinimum" => numbers.is_some_and(|(v, b)| v <= b),
            "exclusiveMaximum" => numbers.is_some_and(|(v, b)| v >= b),
            "multipleOf" => numbers.is_some_and(|(v, b)| b > 0.0 && (v / b).fract() != 0.0),
            "minLength" => value
                .as_str()
                .zip(bound.as_u64())
                .is_some_and(|(s, b)| (s.chars().count() as u64) < b),
            "maxLength" => value
                .as_str()
                .zip(bound.as_u64())
                .is_some_and(|(s, b)| (s.chars().count() as u64) > b),
            "pattern" => match (value.as_str(), bound.as_str()) {
                (Some(s), Some(pattern)) => Regex::new(pattern).map_or(true, |re| !re.is_match(s)),
                _ => false,
            },
            "minItems" => value
                .as_array()
                .zip(bound.as_u64())
                .is_some_and(|(a, b)| (a.len() as u64) < b),
            "maxItems" => value
                .as_array()
                .zip(bound.as_u64())
                .is_some_and(|(a, b)| (a.len() as u64) > b),
            "uniqueItems" => bound.as_bool() == Some(true)
                && value.as_array().is_some_and(|items| {
                    items
                        .iter()
                        .enumerate()
                        .any(|(i, item)| items[..i].contains(item))
                }),
            "minProperties" => value
                .as_object()
                .zip(bound.as_u64())
                .is_some_and(|(o, b)| (o.len() as u64) < b),
            "maxProperties" => value
                .as_object()
                .zip(bound.as_u64())
                .is_some_and(|(o, b)| (o.len() as u64) > b),
            _ => false,
        };

        if violated {
            errors.push(violation(path, value, keyword, bound));
        }
    }
}

fn check_items(schema: &Map<String, Value>, items: &[Value], path: &str, errors: &mut Vec<FieldError>) {
    match schema.get("items") {
        Some(Value::Array(slots)) => {
            if slots.len() != items.len() {
                errors.push(FieldError::new(
                    path,
                    format!("expected {} items, found {}", slots.len(), items.len()),
                ));
                return;
            }
            for (i, (slot, item)) in slots.iter().zip(items).enumerate() {
                check_value(slot, item, &format!("{path}[{i}]"), errors);
            }
        }
        Some(item_schema) => {
            for (i, item) in items.iter().enumerate() {
                check_value(item_schema, item, &format!("{path}[{i}]"), errors);
            }
        }
        None => {}
    }
}

fn check_properties(
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    let properties = schema.get("properties").and_then(Value::as_object);

    for name in schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if !object.contains_key(name) {
            errors.push(FieldError::new(format!("{path}.{name}"), "field required"));
        }
    }

    for (name, value) in object {
        let property_path = format!("{path}.{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(property) => check_value(property, value, &property_path, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    errors.push(FieldError::new(property_path, "unknown field"));
                }
                Some(additional @ Value::Object(_)) => {
                    check_value(additional, value, &property_path, errors);
                }
                _ => {}
            },
        }
    }
}
