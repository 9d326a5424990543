use crucible_process::JobError;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// The lifecycle state of a job. A job moves forward through these states and never goes
/// back: `accepted` to `running`, then to exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Accepted,
    Running,
    Successful,
    Failed,
    Dismissed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Accepted, JobStatus::Running) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Dismissed => "dismissed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Process,
}

/// A snapshot of a job's state, in the shape of an OGC `statusInfo` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(rename = "processID")]
    pub process_id: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub status: JobStatus,
    /// Percent complete, 0 to 100.
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished: Option<OffsetDateTime>,
    /// The error chain of a failed job, outermost context first.
    #[serde(default)]
    pub traceback: Option<Vec<String>>,
}

impl JobInfo {
    pub(crate) fn accepted(process_id: &str, job_id: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            job_type: JobType::Process,
            process_id: process_id.to_string(),
            job_id: job_id.to_string(),
            status: JobStatus::Accepted,
            progress: None,
            message: None,
            created: now,
            started: None,
            updated: now,
            finished: None,
            traceback: None,
        }
    }
}

/// The outputs of a successful job, keyed by output name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobResults(Map<String, Value>);

impl JobResults {
    /// Map a process function's return value to its declared outputs. With several outputs
    /// the value must be an array holding one element per output, in declaration order.
    pub fn from_return_value(names: &[String], value: Value) -> Result<Self, Report<JobError>> {
        match names {
            [] => Ok(Self::default()),
            [name] => Ok(Self(Map::from_iter([(name.clone(), value)]))),
            names => match value {
                Value::Array(values) if values.len() == names.len() => {
                    Ok(Self(names.iter().cloned().zip(values).collect()))
                }
                other => {
                    let found = match &other {
                        Value::Array(values) => format!("{} values", values.len()),
                        _ => "a single value".to_string(),
                    };
                    Err(Report::new(JobError::Output).attach_printable(format!(
                        "expected {} return values, found {found}",
                        names.len()
                    )))
                }
            },
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}
