use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::Report;
use tracing::{event, Level};

use crate::error::JobError;

/// The capability a running process function uses to report progress and observe
/// cancellation. It is always passed to the function explicitly.
///
/// Cancellation is cooperative: a cancelled job keeps running until its function calls
/// [JobContext::report_progress] or [JobContext::check_cancelled], which then fail with
/// [JobError::Cancelled]. A function that never calls back into its context can't be
/// cancelled.
pub trait JobContext: Send + Sync {
    /// The ID of the job being run.
    fn job_id(&self) -> &str;

    /// Update the job's progress (clamped to 0-100) and/or status message. Fields passed as
    /// `None` keep their previous values. Fails with [JobError::Cancelled] without updating
    /// anything if the job has been cancelled.
    fn report_progress(
        &self,
        progress: Option<u8>,
        message: Option<&str>,
    ) -> Result<(), Report<JobError>>;

    /// Return true if cancellation of the job was requested.
    fn is_cancelled(&self) -> bool;

    /// Fail with [JobError::Cancelled] if cancellation of the job was requested.
    fn check_cancelled(&self) -> Result<(), Report<JobError>> {
        if self.is_cancelled() {
            Err(Report::new(JobError::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// A context that isn't attached to any job, for calling process functions directly.
#[derive(Debug, Default)]
pub struct DetachedContext {
    cancelled: AtomicBool,
}

impl DetachedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl JobContext for DetachedContext {
    fn job_id(&self) -> &str {
        "detached"
    }

    fn report_progress(
        &self,
        progress: Option<u8>,
        message: Option<&str>,
    ) -> Result<(), Report<JobError>> {
        self.check_cancelled()?;
        event!(Level::TRACE, ?progress, ?message, "progress on detached context");
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
