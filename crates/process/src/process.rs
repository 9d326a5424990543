use std::{fmt::Debug, sync::Arc};

use ahash::HashSet;
use error_stack::{Report, ResultExt};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{event, Level};

use crate::{
    context::JobContext,
    description::{
        FieldMeta, InputDescription, JobControlOption, MaxOccurs, OutputDescription,
        ProcessDescription,
    },
    error::{JobError, ProcessError, SchemaRole},
    model::{validate_as, Arguments, InputField, InputModel, ValidateFn},
    schema::{self, schema_for, SchemaFn, SchemaSubject},
};

/// The type-erased process function. Its return value is already serialized.
pub type ProcessFn =
    dyn Fn(&dyn JobContext, Arguments) -> Result<Value, Report<JobError>> + Send + Sync;

/// The name of the single output of a process that doesn't name its outputs.
pub const RETURN_VALUE: &str = "return_value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// A regular input.
    Value,
    /// Receives the job's [JobContext]. It is not an input.
    JobContext,
    /// A structured model whose fields are the process inputs.
    AggregateInputs,
}

/// One declared parameter of a process function.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub role: ParamRole,
    /// `Some(Value::Null)` is an explicit null default, distinct from no default.
    pub default: Option<Value>,
}

struct ParamDecl {
    param: Parameter,
    schema: Option<SchemaFn>,
    validate: Option<ValidateFn>,
}

/// Declares the signature and metadata of a process, then binds it to a function.
///
/// ```ignore
/// let process = ProcessBuilder::new("greet")
///     .param::<i64>("x")
///     .param_with_default("y", "hi".to_string())
///     .build(|_ctx, args| {
///         let x: i64 = args.get("x")?;
///         let y: String = args.get("y")?;
///         Ok(format!("{y} {x}"))
///     })?;
/// ```
pub struct ProcessBuilder {
    id: String,
    version: Option<String>,
    title: Option<String>,
    description: Option<String>,
    params: Vec<ParamDecl>,
    input_fields: Vec<(String, FieldMeta)>,
    outputs: Vec<(String, FieldMeta)>,
    invalid_defaults: Vec<String>,
    qualified_name: Option<String>,
}

impl Debug for ProcessBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBuilder")
            .field("id", &self.id)
            .field(
                "params",
                &self.params.iter().map(|p| &p.param).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProcessBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            title: None,
            description: None,
            params: Vec::new(),
            input_fields: Vec::new(),
            outputs: Vec::new(),
            invalid_defaults: Vec::new(),
            qualified_name: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the `module:name` reference of the process instead of deriving it from the
    /// function's type.
    pub fn qualified_name(mut self, name: impl Into<String>) -> Self {
        self.qualified_name = Some(name.into());
        self
    }

    /// Declare a required input.
    pub fn param<T: DeserializeOwned + JsonSchema>(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDecl {
            param: Parameter {
                name: name.into(),
                role: ParamRole::Value,
                default: None,
            },
            schema: Some(schema_for::<T>),
            validate: Some(validate_as::<T>),
        });
        self
    }

    /// Declare an optional input with a default value.
    pub fn param_with_default<T: Serialize + DeserializeOwned + JsonSchema>(
        mut self,
        name: impl Into<String>,
        default: T,
    ) -> Self {
        let name = name.into();
        let default = match serde_json::to_value(default) {
            Ok(value) => Some(value),
            Err(_) => {
                self.invalid_defaults.push(name.clone());
                None
            }
        };

        self.params.push(ParamDecl {
            param: Parameter {
                name,
                role: ParamRole::Value,
                default,
            },
            schema: Some(schema_for::<T>),
            validate: Some(validate_as::<T>),
        });
        self
    }

    /// Declare the parameter that receives the job context. It doesn't appear in the inputs.
    pub fn job_context(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDecl {
            param: Parameter {
                name: name.into(),
                role: ParamRole::JobContext,
                default: None,
            },
            schema: None,
            validate: None,
        });
        self
    }

    /// Declare a single parameter whose fields are the process inputs. The function reads it
    /// with [Arguments::inputs].
    pub fn aggregate_inputs<M: DeserializeOwned + JsonSchema>(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.params.push(ParamDecl {
            param: Parameter {
                name: name.into(),
                role: ParamRole::AggregateInputs,
                default: None,
            },
            schema: Some(schema_for::<M>),
            validate: Some(validate_as::<M>),
        });
        self
    }

    /// Attach metadata to an input field.
    pub fn input_field(mut self, name: impl Into<String>, meta: FieldMeta) -> Self {
        self.input_fields.push((name.into(), meta));
        self
    }

    /// Declare a named output. Declaring more than one requires the function to return a
    /// tuple with one slot per output, in declaration order.
    pub fn output(mut self, name: impl Into<String>, meta: FieldMeta) -> Self {
        self.outputs.push((name.into(), meta));
        self
    }

    /// Derive the process description and bind the function.
    pub fn build<R, F>(self, function: F) -> Result<Process, Report<ProcessError>>
    where
        R: Serialize + JsonSchema,
        F: Fn(&dyn JobContext, Arguments) -> Result<R, Report<JobError>> + Send + Sync + 'static,
    {
        let ProcessBuilder {
            id,
            version,
            title,
            description,
            params,
            input_fields,
            outputs,
            invalid_defaults,
            qualified_name: declared_name,
        } = self;

        if let Some(name) = invalid_defaults.into_iter().next() {
            return Err(Report::new(ProcessError::InvalidDefault { name }));
        }

        check_parameters(&id, &params)?;

        let job_ctx_arg = params
            .iter()
            .find(|p| p.param.role == ParamRole::JobContext)
            .map(|p| p.param.name.clone());
        let aggregate = params
            .iter()
            .find(|p| p.param.role == ParamRole::AggregateInputs);
        let inputs_arg = aggregate.map(|p| p.param.name.clone());

        let mut fields = match aggregate {
            Some(decl) => aggregate_fields(&id, decl)?,
            None => value_fields(&id, &params)?,
        };
        apply_field_meta(&id, &mut fields, input_fields)?;

        let inputs = fields
            .iter()
            .map(|field| {
                let desc = InputDescription {
                    title: field.title.clone().unwrap_or_else(|| field.name.clone()),
                    description: field.description.clone(),
                    schema: field.schema.clone(),
                    min_occurs: if field.required { 1 } else { 0 },
                    max_occurs: MaxOccurs::for_schema(&field.schema),
                };
                (field.name.clone(), desc)
            })
            .collect::<IndexMap<_, _>>();

        let return_schema = schema_for::<R>(&SchemaSubject {
            process: &id,
            name: "return",
            role: SchemaRole::Output,
        })
        .change_context_lazy(|| ProcessError::Schema(id.clone()))?;
        let outputs = split_outputs(&id, outputs, return_schema)?;
        let output_names = outputs.keys().cloned().collect();

        let input_model = InputModel {
            process: id.clone(),
            fields,
            aggregate: aggregate.and_then(|decl| {
                decl.validate
                    .map(|validate| (decl.param.name.clone(), validate))
            }),
        };

        let description = ProcessDescription {
            title: title.unwrap_or_else(|| id.clone()),
            id,
            version: version.unwrap_or_else(|| "0.0.0".to_string()),
            description,
            job_control_options: vec![
                JobControlOption::SyncExecute,
                JobControlOption::AsyncExecute,
                JobControlOption::Dismiss,
            ],
            inputs,
            outputs,
        };

        let qualified_name = declared_name
            .unwrap_or_else(|| qualified_name(std::any::type_name::<F>(), &description.id));
        event!(Level::DEBUG, process = %description.id, %qualified_name, "Built process");

        let function: Box<ProcessFn> = Box::new(move |ctx: &dyn JobContext, args: Arguments| {
            let output = function(ctx, args)?;
            serde_json::to_value(output).change_context(JobError::Output)
        });

        Ok(Process {
            inner: Arc::new(ProcessInner {
                function,
                signature: params.into_iter().map(|p| p.param).collect(),
                input_model,
                description,
                inputs_arg,
                job_ctx_arg,
                output_names,
                qualified_name,
            }),
        })
    }
}

fn check_parameters(process: &str, params: &[ParamDecl]) -> Result<(), Report<ProcessError>> {
    let mut seen = HashSet::default();
    for decl in params {
        if !seen.insert(decl.param.name.as_str()) {
            return Err(Report::new(ProcessError::DuplicateParameter {
                process: process.to_string(),
                name: decl.param.name.clone(),
            }));
        }
    }

    let contexts = params
        .iter()
        .filter(|p| p.param.role == ParamRole::JobContext)
        .map(|p| p.param.name.as_str())
        .collect::<Vec<_>>();
    if let [first, second, ..] = contexts.as_slice() {
        return Err(Report::new(ProcessError::MultipleJobContexts {
            process: process.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        }));
    }

    if let Some(aggregate) = params
        .iter()
        .find(|p| p.param.role == ParamRole::AggregateInputs)
    {
        let others = params.iter().any(|p| {
            p.param.role != ParamRole::JobContext && p.param.name != aggregate.param.name
        });
        if others {
            return Err(Report::new(ProcessError::AggregateNotSole {
                process: process.to_string(),
                name: aggregate.param.name.clone(),
            }));
        }
    }

    Ok(())
}

fn derive_param_schema(process: &str, decl: &ParamDecl) -> Result<Value, Report<ProcessError>> {
    let subject = SchemaSubject {
        process,
        name: &decl.param.name,
        role: SchemaRole::Input,
    };

    match decl.schema {
        Some(schema_fn) => {
            schema_fn(&subject).change_context_lazy(|| ProcessError::Schema(process.to_string()))
        }
        None => Ok(Value::Object(Map::new())),
    }
}

/// One field per value parameter.
fn value_fields(process: &str, params: &[ParamDecl]) -> Result<Vec<InputField>, Report<ProcessError>> {
    params
        .iter()
        .filter(|decl| decl.param.role == ParamRole::Value)
        .map(|decl| {
            let mut schema = derive_param_schema(process, decl)?;
            if let (Some(default), Value::Object(map)) = (&decl.param.default, &mut schema) {
                map.insert("default".to_string(), default.clone());
            }

            Ok(InputField {
                name: decl.param.name.clone(),
                title: None,
                description: None,
                schema,
                default: decl.param.default.clone(),
                required: decl.param.default.is_none(),
                validate: decl.validate,
            })
        })
        .collect()
}

/// One field per property of the aggregate inputs model.
fn aggregate_fields(process: &str, decl: &ParamDecl) -> Result<Vec<InputField>, Report<ProcessError>> {
    let not_a_model = || {
        Report::new(ProcessError::AggregateNotModel {
            process: process.to_string(),
            name: decl.param.name.clone(),
        })
    };

    let schema = derive_param_schema(process, decl)?;
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(not_a_model());
    }
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(not_a_model)?;
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    let fields = properties
        .iter()
        .map(|(name, property)| {
            let default = property.get("default").cloned();
            InputField {
                name: name.clone(),
                title: property.get("title").and_then(Value::as_str).map(String::from),
                description: property
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                schema: property.clone(),
                required: default.is_none() && required.contains(&name.as_str()),
                default,
                validate: None,
            }
        })
        .collect();

    Ok(fields)
}

fn apply_field_meta(
    process: &str,
    fields: &mut [InputField],
    metadata: Vec<(String, FieldMeta)>,
) -> Result<(), Report<ProcessError>> {
    let unknown = metadata
        .iter()
        .filter(|(name, _)| !fields.iter().any(|f| &f.name == name))
        .map(|(name, _)| name.clone())
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        return Err(Report::new(ProcessError::UnknownInputFields {
            process: process.to_string(),
            names: unknown,
        }));
    }

    for (name, meta) in metadata {
        let Some(field) = fields.iter_mut().find(|f| f.name == name) else {
            continue;
        };

        if meta.title.is_some() {
            field.title = meta.title;
        }
        if meta.description.is_some() {
            field.description = meta.description;
        }
        if let Value::Object(schema) = &mut field.schema {
            schema.extend(meta.schema);
        }
    }

    Ok(())
}

fn output_description(name: &str, meta: FieldMeta, schema: Value) -> OutputDescription {
    OutputDescription {
        title: meta.title.unwrap_or_else(|| name.to_string()),
        description: meta.description,
        schema,
    }
}

/// Map the return type onto the declared outputs.
fn split_outputs(
    process: &str,
    outputs: Vec<(String, FieldMeta)>,
    return_schema: Value,
) -> Result<IndexMap<String, OutputDescription>, Report<ProcessError>> {
    if outputs.len() <= 1 {
        if outputs.is_empty() && schema::is_unit(&return_schema) {
            return Ok(IndexMap::new());
        }

        let (name, meta) = outputs
            .into_iter()
            .next()
            .unwrap_or_else(|| (RETURN_VALUE.to_string(), FieldMeta::default()));
        let desc = output_description(&name, meta, return_schema);
        return Ok(IndexMap::from_iter([(name, desc)]));
    }

    let slots = schema::tuple_items(&return_schema).ok_or_else(|| {
        Report::new(ProcessError::OutputNotTuple {
            process: process.to_string(),
            expected: outputs.len(),
        })
    })?;

    if slots.len() != outputs.len() {
        return Err(Report::new(ProcessError::OutputArity {
            process: process.to_string(),
            expected: outputs.len(),
            found: slots.len(),
        }));
    }

    Ok(outputs
        .into_iter()
        .zip(slots.iter().cloned())
        .map(|((name, meta), schema)| {
            let desc = output_description(&name, meta, schema);
            (name, desc)
        })
        .collect())
}

/// Turn a Rust type path like `app::tasks::add` into a `module:name` reference. Closures
/// share the path of the function they are defined in, so theirs also carries the process ID.
fn qualified_name(type_name: &str, process: &str) -> String {
    let mut path = type_name;
    let mut closure = false;
    while let Some(enclosing) = path.strip_suffix("::{{closure}}") {
        path = enclosing;
        closure = true;
    }

    let reference = match path.rsplit_once("::") {
        Some((module, name)) => format!("{module}:{name}"),
        None => path.to_string(),
    };

    if closure {
        format!("{reference}::{{{{closure}}}}#{process}")
    } else {
        reference
    }
}

struct ProcessInner {
    function: Box<ProcessFn>,
    signature: Vec<Parameter>,
    input_model: InputModel,
    description: ProcessDescription,
    inputs_arg: Option<String>,
    job_ctx_arg: Option<String>,
    output_names: Vec<String>,
    qualified_name: String,
}

/// An immutable process description bound to the function that implements it. Cloning a
/// process is cheap.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("qualified_name", &self.inner.qualified_name)
            .field("signature", &self.inner.signature)
            .finish()
    }
}

impl Process {
    pub fn builder(id: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.description.id
    }

    pub fn description(&self) -> &ProcessDescription {
        &self.inner.description
    }

    pub fn signature(&self) -> &[Parameter] {
        &self.inner.signature
    }

    pub fn input_model(&self) -> &InputModel {
        &self.inner.input_model
    }

    /// The name of the aggregate inputs parameter, if the process has one.
    pub fn inputs_arg(&self) -> Option<&str> {
        self.inner.inputs_arg.as_deref()
    }

    /// The name of the job context parameter, if the process declares one.
    pub fn job_ctx_arg(&self) -> Option<&str> {
        self.inner.job_ctx_arg.as_deref()
    }

    /// The declared output names, in the order the return value maps onto them.
    pub fn output_names(&self) -> &[String] {
        &self.inner.output_names
    }

    /// The `module:name` reference of the function implementing the process.
    pub fn qualified_name(&self) -> &str {
        &self.inner.qualified_name
    }

    /// Call the function with validated arguments, as returned by [InputModel::validate].
    pub fn call(&self, ctx: &dyn JobContext, args: Arguments) -> Result<Value, Report<JobError>> {
        let args = args.with_inputs_arg(self.inputs_arg());
        (self.inner.function)(ctx, args)
    }
}
