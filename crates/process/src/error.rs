use std::fmt::Display;

use error_stack::Report;
use serde::Serialize;
use thiserror::Error;

/// Whether a schema describes a process input or its return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaRole {
    Input,
    Output,
}

impl Display for SchemaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaRole::Input => f.write_str("input"),
            SchemaRole::Output => f.write_str("return value"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("process `{process}` has no schema mapping for {role} `{name}`")]
    Unmappable {
        process: String,
        name: String,
        role: SchemaRole,
    },
    #[error("unresolved schema reference `{0}`")]
    UnresolvedRef(String),
    #[error("failed to serialize the generated schema")]
    Serialize,
}

/// Errors raised while building a [Process](crate::Process) from a function.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process `{process}` declares more than one job context parameter: `{first}` and `{second}`")]
    MultipleJobContexts {
        process: String,
        first: String,
        second: String,
    },
    #[error("process `{process}` declares parameter `{name}` more than once")]
    DuplicateParameter { process: String, name: String },
    #[error("aggregate inputs parameter `{name}` must be the only parameter of process `{process}`")]
    AggregateNotSole { process: String, name: String },
    #[error("aggregate inputs parameter `{name}` of process `{process}` is not a structured model")]
    AggregateNotModel { process: String, name: String },
    #[error("process `{process}` has field metadata for unknown inputs: {}", .names.join(", "))]
    UnknownInputFields { process: String, names: Vec<String> },
    #[error("process `{process}` declares {expected} outputs but its return value is not a fixed-length tuple")]
    OutputNotTuple { process: String, expected: usize },
    #[error("process `{process}` declares {expected} outputs but its return value has {found} slots")]
    OutputArity {
        process: String,
        expected: usize,
        found: usize,
    },
    #[error("default value of parameter `{name}` could not be serialized")]
    InvalidDefault { name: String },
    #[error("failed to derive schemas for process `{0}`")]
    Schema(String),
}

/// The error type returned by process functions.
///
/// [JobError::Cancelled] is the cancellation signal raised by
/// [JobContext::check_cancelled](crate::JobContext::check_cancelled). A job that fails with it
/// anywhere in its error chain is dismissed rather than failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,
    #[error("invalid argument `{0}`")]
    Argument(String),
    #[error("failed to serialize the return value")]
    Output,
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

/// Return true if the report was caused by a cancellation request.
pub fn is_cancellation(report: &Report<JobError>) -> bool {
    report
        .frames()
        .any(|frame| matches!(frame.downcast_ref::<JobError>(), Some(JobError::Cancelled)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Request inputs did not match a process's input model. Every failing field is listed.
#[derive(Error, Debug, Clone)]
#[error("invalid inputs for process `{process}`: {}", describe_fields(.errors))]
pub struct ValidationError {
    pub process: String,
    pub errors: Vec<FieldError>,
}

fn describe_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use error_stack::ResultExt;

    use super::*;

    #[test]
    fn cancellation_is_found_below_other_contexts() {
        let result: Result<(), Report<JobError>> = Err(Report::new(JobError::Cancelled));
        let report = result
            .change_context(JobError::failed("step 3"))
            .unwrap_err();
        assert!(is_cancellation(&report));
        assert!(!is_cancellation(&Report::new(JobError::failed("boom"))));
    }

    #[test]
    fn validation_error_lists_fields() {
        let err = ValidationError {
            process: "add".to_string(),
            errors: vec![
                FieldError::new("x", "field required"),
                FieldError::new("y", "invalid type"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "invalid inputs for process `add`: x: field required; y: invalid type"
        );
    }

    #[test]
    fn unknown_fields_are_named() {
        let err = ProcessError::UnknownInputFields {
            process: "add".to_string(),
            names: vec!["z".to_string(), "w".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "process `add` has field metadata for unknown inputs: z, w"
        );
    }
}
