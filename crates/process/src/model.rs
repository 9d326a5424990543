//! The input model of a process: validating request inputs and binding them to arguments.

use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{event, Level};

use crate::{
    error::{FieldError, JobError, ValidationError},
    validate::check_value,
};

/// Checks that a value deserializes into a parameter's declared type.
pub type ValidateFn = fn(&Value) -> Result<(), serde_json::Error>;

pub(crate) fn validate_as<T: DeserializeOwned>(value: &Value) -> Result<(), serde_json::Error> {
    T::deserialize(value).map(|_| ())
}

#[derive(Debug, Clone)]
pub struct InputField {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// The derived schema, with the declared default and metadata keywords merged in.
    /// Inputs are checked against it.
    pub schema: Value,
    pub default: Option<Value>,
    pub required: bool,
    pub(crate) validate: Option<ValidateFn>,
}

/// The validator synthesized from a process's parameters.
#[derive(Debug, Clone)]
pub struct InputModel {
    pub(crate) process: String,
    pub(crate) fields: Vec<InputField>,
    /// When the process takes an aggregate inputs parameter, its name and the validator for
    /// the whole model.
    pub(crate) aggregate: Option<(String, ValidateFn)>,
}

impl InputModel {
    pub fn fields(&self) -> &[InputField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&InputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate request inputs and bind them to the function's parameters. Declared defaults
    /// fill in missing inputs and explicit inputs override them. Inputs that match no field
    /// are ignored.
    pub fn validate(
        &self,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, Report<ValidationError>> {
        let mut errors = Vec::new();
        let mut bound = Map::new();

        for field in &self.fields {
            let Some(value) = inputs.get(&field.name).or(field.default.as_ref()) else {
                if field.required {
                    errors.push(FieldError::new(&field.name, "field required"));
                }
                continue;
            };

            if let Some(validate) = field.validate {
                if let Err(e) = validate(value) {
                    errors.push(FieldError::new(&field.name, e.to_string()));
                    continue;
                }
            }

            let before = errors.len();
            check_value(&field.schema, value, &field.name, &mut errors);
            if errors.len() > before {
                continue;
            }

            bound.insert(field.name.clone(), value.clone());
        }

        for name in inputs.keys() {
            if self.field(name).is_none() {
                event!(Level::DEBUG, process = %self.process, input = %name, "Ignoring unknown input");
            }
        }

        if errors.is_empty() {
            if let Some((name, validate)) = &self.aggregate {
                let model = Value::Object(bound);
                if let Err(e) = validate(&model) {
                    errors.push(FieldError::new(name, e.to_string()));
                }
                bound = Map::from_iter([(name.clone(), model)]);
            }
        }

        if errors.is_empty() {
            Ok(bound)
        } else {
            Err(Report::new(ValidationError {
                process: self.process.clone(),
                errors,
            }))
        }
    }
}

/// The validated arguments passed to a process function.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: Map<String, Value>,
    inputs_arg: Option<String>,
}

impl Arguments {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values,
            inputs_arg: None,
        }
    }

    pub(crate) fn with_inputs_arg(mut self, inputs_arg: Option<&str>) -> Self {
        self.inputs_arg = inputs_arg.map(String::from);
        self
    }

    /// Deserialize the named argument. A missing argument reads as `null`, so optional
    /// parameters come out as `None`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, Report<JobError>> {
        let value = self.values.get(name).unwrap_or(&Value::Null);
        T::deserialize(value).change_context_lazy(|| JobError::Argument(name.to_string()))
    }

    /// Deserialize the aggregate inputs model of a process built with
    /// [ProcessBuilder::aggregate_inputs](crate::ProcessBuilder::aggregate_inputs).
    pub fn inputs<M: DeserializeOwned>(&self) -> Result<M, Report<JobError>> {
        let name = self
            .inputs_arg
            .as_deref()
            .ok_or_else(|| Report::new(JobError::Argument("inputs".to_string())))
            .attach_printable("process has no aggregate inputs parameter")?;
        self.get(name)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }
}

impl FromIterator<(String, Value)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Arguments::new(iter.into_iter().collect())
    }
}
