//! Derive OpenAPI 3.0 schemas from Rust types.
//!
//! Types describe themselves through [schemars::JsonSchema], which generates draft-07 JSON
//! Schema. [to_openapi] rewrites that output into the subset of constructs OpenAPI 3.0
//! understands: `null` union members become `nullable: true`, unions become `oneOf`,
//! `const` becomes a single-value `enum`, and every `$ref` is replaced by an inlined copy of
//! its definition so that no reference escapes to the caller.

use error_stack::{Report, ResultExt};
use schemars::{gen::SchemaSettings, JsonSchema};
use serde_json::{json, Map, Value};

use crate::error::{SchemaError, SchemaRole};

/// Names the process parameter a schema is being derived for, for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct SchemaSubject<'a> {
    pub process: &'a str,
    pub name: &'a str,
    pub role: SchemaRole,
}

/// A monomorphized [schema_for], stored by the process builder until the process is built.
pub type SchemaFn = fn(&SchemaSubject<'_>) -> Result<Value, Report<SchemaError>>;

/// Keywords that annotate a schema without constraining the values it accepts.
const ANNOTATIONS: &[&str] = &[
    "title",
    "description",
    "default",
    "examples",
    "example",
    "readOnly",
    "writeOnly",
    "deprecated",
    "$schema",
    "$id",
    "definitions",
    "$defs",
];

/// Derive the OpenAPI 3.0 schema for `T`.
pub fn schema_for<T: JsonSchema>(subject: &SchemaSubject<'_>) -> Result<Value, Report<SchemaError>> {
    let generator = SchemaSettings::draft07().into_generator();
    let root = generator.into_root_schema_for::<T>();
    let root = serde_json::to_value(root).change_context(SchemaError::Serialize)?;
    to_openapi(root, subject)
}

/// Convert a draft-07 JSON Schema document, with its `definitions`, into a self-contained
/// OpenAPI 3.0 schema.
pub fn to_openapi(root: Value, subject: &SchemaSubject<'_>) -> Result<Value, Report<SchemaError>> {
    let Value::Object(mut root) = root else {
        return Err(unmappable(subject));
    };

    let mut definitions = Map::new();
    for key in ["definitions", "$defs"] {
        if let Some(Value::Object(defs)) = root.remove(key) {
            definitions.extend(defs);
        }
    }
    // schemars titles the root schema after the Rust type name.
    root.remove("title");

    let mut converter = Converter {
        definitions: &definitions,
        subject,
        expanding: Vec::new(),
    };
    converter.convert(&Value::Object(root))
}

/// Return true for the schema of `()`, which has no OpenAPI representation besides `null`.
pub fn is_unit(schema: &Value) -> bool {
    schema.get("nullable") == Some(&Value::Bool(true))
        && schema.get("enum") == Some(&json!([null]))
        && schema.get("type").is_none()
}

/// If the schema is a fixed-length tuple, return the schemas of its slots.
pub fn tuple_items(schema: &Value) -> Option<&Vec<Value>> {
    if schema.get("type").and_then(Value::as_str) != Some("array") {
        return None;
    }

    let items = schema.get("items")?.as_array()?;
    let len = items.len() as u64;
    let min = schema.get("minItems").and_then(Value::as_u64);
    let max = schema.get("maxItems").and_then(Value::as_u64);
    (min == Some(len) && max == Some(len)).then_some(items)
}

fn unmappable(subject: &SchemaSubject<'_>) -> Report<SchemaError> {
    Report::new(SchemaError::Unmappable {
        process: subject.process.to_string(),
        name: subject.name.to_string(),
        role: subject.role,
    })
}

fn is_null_schema(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("null")
}

/// Insert every key of `source` that `target` does not already define.
fn merge_missing(target: &mut Map<String, Value>, source: Value) {
    if let Value::Object(source) = source {
        for (key, value) in source {
            target.entry(key).or_insert(value);
        }
    }
}

struct Converter<'a> {
    definitions: &'a Map<String, Value>,
    subject: &'a SchemaSubject<'a>,
    /// Definitions currently being inlined, to cut off recursive types.
    expanding: Vec<String>,
}

impl<'a> Converter<'a> {
    fn convert(&mut self, node: &Value) -> Result<Value, Report<SchemaError>> {
        match node {
            Value::Object(map) => self.convert_object(map),
            _ => Err(unmappable(self.subject)),
        }
    }

    fn convert_list(&mut self, nodes: &Value) -> Result<Vec<Value>, Report<SchemaError>> {
        match nodes {
            Value::Array(nodes) => nodes.iter().map(|node| self.convert(node)).collect(),
            _ => Err(unmappable(self.subject)),
        }
    }

    fn convert_object(&mut self, map: &Map<String, Value>) -> Result<Value, Report<SchemaError>> {
        if map.keys().all(|key| ANNOTATIONS.contains(&key.as_str())) {
            return Err(unmappable(self.subject));
        }

        let mut out = Map::new();
        let mut nullable = false;

        for (key, value) in map {
            match key.as_str() {
                "$schema" | "$id" | "definitions" | "$defs" => {}
                "$ref" => {
                    let reference = value.as_str().unwrap_or_default();
                    let target = self.resolve(reference)?;
                    merge_missing(&mut out, target);
                }
                "type" => match value {
                    Value::Array(types) => {
                        let non_null = types
                            .iter()
                            .filter(|t| t.as_str() != Some("null"))
                            .collect::<Vec<_>>();
                        nullable |= non_null.len() < types.len();
                        match non_null.as_slice() {
                            [] => {
                                out.insert("enum".to_string(), json!([null]));
                            }
                            [single] => {
                                out.insert("type".to_string(), (*single).clone());
                            }
                            many => {
                                let arms = many.iter().map(|t| json!({ "type": t })).collect();
                                out.insert("oneOf".to_string(), Value::Array(arms));
                            }
                        }
                    }
                    Value::String(t) if t == "null" => {
                        nullable = true;
                        out.insert("enum".to_string(), json!([null]));
                    }
                    other => {
                        out.insert("type".to_string(), other.clone());
                    }
                },
                "anyOf" | "oneOf" => {
                    let mut arms = Vec::new();
                    for arm in value.as_array().into_iter().flatten() {
                        if is_null_schema(arm) {
                            nullable = true;
                        } else {
                            arms.push(self.convert(arm)?);
                        }
                    }

                    match arms.len() {
                        0 => {
                            out.insert("enum".to_string(), json!([null]));
                        }
                        1 => merge_missing(&mut out, arms.remove(0)),
                        _ => {
                            out.insert("oneOf".to_string(), Value::Array(arms));
                        }
                    }
                }
                "allOf" => {
                    let mut arms = self.convert_list(value)?;
                    if arms.len() == 1 {
                        merge_missing(&mut out, arms.remove(0));
                    } else {
                        out.insert("allOf".to_string(), Value::Array(arms));
                    }
                }
                "items" => {
                    let items = match value {
                        Value::Array(_) => Value::Array(self.convert_list(value)?),
                        _ => self.convert(value)?,
                    };
                    out.insert("items".to_string(), items);
                }
                "prefixItems" => {
                    let items = self.convert_list(value)?;
                    out.insert("items".to_string(), Value::Array(items));
                }
                "additionalProperties" => {
                    let additional = match value {
                        Value::Bool(false) => Value::Bool(false),
                        _ => self.convert(value)?,
                    };
                    out.insert(key.clone(), additional);
                }
                "properties" => {
                    let mut properties = Map::new();
                    for (name, property) in value.as_object().into_iter().flatten() {
                        properties.insert(name.clone(), self.convert(property)?);
                    }
                    out.insert(key.clone(), Value::Object(properties));
                }
                "not" => {
                    let not = self.convert(value)?;
                    out.insert(key.clone(), not);
                }
                "const" => {
                    out.insert("enum".to_string(), Value::Array(vec![value.clone()]));
                }
                _ => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }

        if nullable {
            out.insert("nullable".to_string(), Value::Bool(true));
        }

        Ok(Value::Object(out))
    }

    /// Inline a fresh copy of the referenced definition.
    fn resolve(&mut self, reference: &str) -> Result<Value, Report<SchemaError>> {
        let name = reference
            .strip_prefix("#/definitions/")
            .or_else(|| reference.strip_prefix("#/$defs/"))
            .ok_or_else(|| Report::new(SchemaError::UnresolvedRef(reference.to_string())))?;

        if self.expanding.iter().any(|n| n == name) {
            // A recursive type can't be inlined, so the inner occurrence stays opaque.
            return Ok(json!({ "type": "object" }));
        }

        let target = self
            .definitions
            .get(name)
            .ok_or_else(|| Report::new(SchemaError::UnresolvedRef(reference.to_string())))?;

        self.expanding.push(name.to_string());
        let converted = self.convert(target);
        self.expanding.pop();
        converted
    }
}

/// Rewrite an OpenAPI 3.0 schema as plain JSON Schema, so that a stock validator can check
/// values against it. `nullable` becomes an `anyOf` with `null`.
#[cfg(test)]
pub(crate) fn to_json_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let out = map
                .iter()
                .filter(|(key, _)| key.as_str() != "nullable")
                .map(|(key, value)| match key.as_str() {
                    "enum" | "default" => (key.clone(), value.clone()),
                    _ => (key.clone(), to_json_schema(value)),
                })
                .collect::<Map<_, _>>();

            if map.get("nullable") == Some(&Value::Bool(true)) {
                json!({ "anyOf": [Value::Object(out), { "type": "null" }] })
            } else {
                Value::Object(out)
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(to_json_schema).collect()),
        other => other.clone(),
    }
}
