//! Describe functions as OGC-style processes.
//!
//! A [ProcessBuilder] declares a function's parameters and outputs. Their schemas are derived
//! from the Rust types through [schemars] and published in the OpenAPI 3.0 flavor. The
//! resulting [Process] validates request inputs and calls the function with them, and a
//! [ProcessRegistry] maps process IDs to processes.
//!
//! Running processes as jobs lives in the `crucible-job-manager` crate.

pub mod context;
pub mod description;
pub mod error;
pub mod model;
pub mod process;
pub mod registry;
pub mod schema;
mod validate;

pub use context::{DetachedContext, JobContext};
pub use description::{
    FieldMeta, InputDescription, JobControlOption, MaxOccurs, OutputDescription,
    ProcessDescription,
};
pub use error::{
    is_cancellation, FieldError, JobError, ProcessError, SchemaError, SchemaRole, ValidationError,
};
pub use model::{Arguments, InputField, InputModel};
pub use process::{ParamRole, Parameter, Process, ProcessBuilder, RETURN_VALUE};
pub use registry::ProcessRegistry;
