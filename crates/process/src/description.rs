//! The serializable description of a process, as published to clients.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobControlOption {
    SyncExecute,
    AsyncExecute,
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDescription {
    pub id: String,
    pub version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub job_control_options: Vec<JobControlOption>,
    pub inputs: IndexMap<String, InputDescription>,
    pub outputs: IndexMap<String, OutputDescription>,
}

/// The upper bound on the number of values an input accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxOccurs {
    Count(u64),
    Unbounded(Unbounded),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unbounded {
    Unbounded,
}

impl MaxOccurs {
    pub const UNBOUNDED: MaxOccurs = MaxOccurs::Unbounded(Unbounded::Unbounded);

    /// Sequence inputs are bounded by their `maxItems`, or unbounded without one.
    /// Scalars have no `maxOccurs`.
    pub fn for_schema(schema: &Value) -> Option<MaxOccurs> {
        if schema.get("type").and_then(Value::as_str) != Some("array") {
            return None;
        }

        Some(
            schema
                .get("maxItems")
                .and_then(Value::as_u64)
                .map(MaxOccurs::Count)
                .unwrap_or(MaxOccurs::UNBOUNDED),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDescription {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Value,
    pub min_occurs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurs: Option<MaxOccurs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescription {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Value,
}

/// Extra metadata for a process input or output, supplied when the process is built.
///
/// Schema keywords are merged into the derived schema. For inputs, the numeric, length, item
/// count and `enum` keywords are also enforced when a job's inputs are validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, flatten)]
    pub schema: Map<String, Value>,
}

impl FieldMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a schema keyword, such as `minimum`.
    pub fn keyword(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.schema.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn max_occurs() {
        assert_eq!(MaxOccurs::for_schema(&json!({ "type": "integer" })), None);
        assert_eq!(
            MaxOccurs::for_schema(&json!({ "type": "array", "items": {} })),
            Some(MaxOccurs::UNBOUNDED)
        );
        assert_eq!(
            MaxOccurs::for_schema(&json!({ "type": "array", "maxItems": 3 })),
            Some(MaxOccurs::Count(3))
        );
    }

    #[test]
    fn input_description_serialization() {
        let input = InputDescription {
            title: "Values".to_string(),
            description: None,
            schema: json!({ "type": "array", "items": { "type": "number" } }),
            min_occurs: 0,
            max_occurs: Some(MaxOccurs::UNBOUNDED),
        };

        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({
                "title": "Values",
                "schema": { "type": "array", "items": { "type": "number" } },
                "minOccurs": 0,
                "maxOccurs": "unbounded",
            })
        );
    }

    #[test]
    fn field_meta_flattens_keywords() {
        let meta: FieldMeta =
            serde_json::from_value(json!({ "title": "Count", "minimum": 1 })).unwrap();
        assert_eq!(meta, FieldMeta::new().title("Count").keyword("minimum", 1));
    }
}
