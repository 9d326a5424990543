//! Run [crucible_process] processes as jobs.
//!
//! A [Job] validates a request against its process, runs the process function, and tracks
//! the job through `accepted`, `running` and one of `successful`, `failed` or `dismissed`.
//! Progress reports and outcomes are posted to the request's subscriber webhooks by a
//! [CallbackReporter]. The [JobManager] runs jobs on Tokio's blocking pool and looks them up
//! by ID.

mod handle;
mod job;
mod manager;
mod reporter;
mod request;
mod status;
#[cfg(test)]
mod test_util;

pub use handle::JobHandle;
pub use job::{Job, JobOptions};
pub use manager::{JobManager, ManagerConfig, ManagerError};
pub use reporter::{CallbackReporter, ReporterConfig, ReporterError};
pub use request::{ExecuteRequest, Subscriber};
pub use status::{JobInfo, JobResults, JobStatus, JobType};
