use error_stack::Report;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{event, Level};

use crate::{
    context::JobContext,
    error::{JobError, ProcessError},
    model::Arguments,
    process::{Process, ProcessBuilder},
};

/// A mapping from process ID to [Process].
///
/// Registering a process under an ID that is already taken replaces the earlier process. The
/// replacement is logged at `WARN`, and [ProcessRegistry::register_process] returns the
/// process that was replaced.
#[derive(Debug, Default, Clone)]
pub struct ProcessRegistry {
    processes: IndexMap<String, Process>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a process from `builder` and `function` and register it. The function is returned
    /// unchanged so that it can still be called directly.
    pub fn register<R, F>(
        &mut self,
        builder: ProcessBuilder,
        function: F,
    ) -> Result<F, Report<ProcessError>>
    where
        R: Serialize + JsonSchema,
        F: Fn(&dyn JobContext, Arguments) -> Result<R, Report<JobError>>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        let process = builder.build(function.clone())?;
        self.register_process(process);
        Ok(function)
    }

    /// Register a process that was already built, returning the process it replaced, if any.
    pub fn register_process(&mut self, process: Process) -> Option<Process> {
        let id = process.id().to_string();
        let previous = self.processes.insert(id.clone(), process);
        if let Some(previous) = previous.as_ref() {
            event!(
                Level::WARN,
                process = %id,
                replaced = %previous.qualified_name(),
                "Process ID registered twice, replacing the earlier process"
            );
        } else {
            event!(Level::DEBUG, process = %id, "Registered process");
        }
        previous
    }

    pub fn get(&self, id: &str) -> Option<&Process> {
        self.processes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    /// Iterate over the registered processes in registration order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &Process)> {
        self.processes.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Serialize every process description, keyed by process ID or, with `use_qual_names`,
    /// by the `module:name` reference of the function implementing it. When one function
    /// backs several processes, the later ones are keyed `module:name#id`.
    pub fn to_json(&self, use_qual_names: bool) -> Value {
        let mut entries = Map::new();
        for (id, process) in &self.processes {
            let desc = match serde_json::to_value(process.description()) {
                Ok(desc) => desc,
                Err(e) => {
                    event!(Level::ERROR, process = %id, error = %e, "Failed to serialize process description");
                    continue;
                }
            };

            let mut key = if use_qual_names {
                process.qualified_name().to_string()
            } else {
                id.clone()
            };
            if entries.contains_key(&key) {
                event!(Level::WARN, process = %id, name = %key, "Qualified name shared by several processes");
                key = format!("{key}#{id}");
            }

            entries.insert(key, desc);
        }

        Value::Object(entries)
    }
}
