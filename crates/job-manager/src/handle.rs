use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crucible_process::{JobContext, JobError};
use error_stack::Report;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{event, Level};

use crate::{
    reporter::{CallbackReporter, ReporterConfig},
    request::{Notification, Subscriber},
    status::{JobInfo, JobResults, JobStatus},
};

struct JobState {
    id: String,
    info: Mutex<JobInfo>,
    results: Mutex<Option<JobResults>>,
    cancelled: AtomicBool,
    subscriber: Subscriber,
    reporter_config: ReporterConfig,
    /// Started on the first notification that has a subscriber URL.
    reporter: OnceCell<CallbackReporter>,
}

/// A shared reference to a job's state. This is the [JobContext] passed to the job's
/// process function, and can be used from other threads to watch or cancel the job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.state.id)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(
        info: JobInfo,
        subscriber: Subscriber,
        reporter_config: ReporterConfig,
    ) -> Self {
        Self {
            state: Arc::new(JobState {
                id: info.job_id.clone(),
                info: Mutex::new(info),
                results: Mutex::new(None),
                cancelled: AtomicBool::new(false),
                subscriber,
                reporter_config,
                reporter: OnceCell::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn job_info(&self) -> JobInfo {
        self.state.info.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.state.info.lock().status
    }

    /// The job's results, once it has succeeded.
    pub fn results(&self) -> Option<JobResults> {
        self.state.results.lock().clone()
    }

    /// Request cancellation. The job notices the next time its function reports progress or
    /// checks for cancellation, or when it starts if it hasn't yet.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            event!(Level::INFO, job = %self.id(), "Cancellation requested");
        }
    }

    /// Apply a change to the job's info and return what `f` returns. `updated` is refreshed
    /// first and never moves backwards, so `f` can copy it into the other timestamps.
    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut JobInfo) -> T) -> T {
        let mut info = self.state.info.lock();
        info.updated = info.updated.max(OffsetDateTime::now_utc());
        f(&mut info)
    }

    pub(crate) fn set_results(&self, results: JobResults) {
        *self.state.results.lock() = Some(results);
    }

    /// Queue a notification for the subscriber, if it asked for this kind.
    pub(crate) fn notify(&self, notification: Notification, payload: &impl Serialize) {
        let Some(url) = self.state.subscriber.url_for(notification) else {
            return;
        };

        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                event!(Level::ERROR, job = %self.id(), error = %e, "Failed to serialize notification");
                return;
            }
        };

        let reporter = self
            .state
            .reporter
            .get_or_try_init(|| CallbackReporter::new(&self.state.reporter_config));
        match reporter {
            Ok(reporter) => reporter.report(url.clone(), payload),
            Err(e) => {
                event!(Level::ERROR, job = %self.id(), error = ?e, "Failed to start callback reporter");
            }
        }
    }

    /// Let the callback reporter deliver its last notification and exit, without waiting.
    pub(crate) fn close_reporter(&self) {
        if let Some(reporter) = self.state.reporter.get() {
            reporter.close();
        }
    }

    /// Wait, up to the configured stop timeout, for the last notification to be delivered.
    pub fn wait_for_notifications(&self) {
        if let Some(reporter) = self.state.reporter.get() {
            reporter.stop();
        }
    }
}

impl JobContext for JobHandle {
    fn job_id(&self) -> &str {
        self.id()
    }

    fn report_progress(
        &self,
        progress: Option<u8>,
        message: Option<&str>,
    ) -> Result<(), Report<JobError>> {
        self.check_cancelled()?;

        let info = self.update(|info| {
            if let Some(progress) = progress {
                info.progress = Some(progress.min(100));
            }
            if let Some(message) = message {
                info.message = Some(message.to_string());
            }
            info.clone()
        });

        event!(Level::DEBUG, job = %self.id(), progress = ?info.progress, message = ?info.message, "Progress");
        self.notify(Notification::InProgress, &info);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use crucible_process::is_cancellation;

    use super::*;

    fn handle() -> JobHandle {
        JobHandle::new(
            JobInfo::accepted("p", "job-1"),
            Subscriber::default(),
            ReporterConfig::default(),
        )
    }

    #[test]
    fn progress_updates_are_partial() {
        let handle = handle();
        handle.report_progress(Some(10), Some("loading")).unwrap();
        handle.report_progress(None, Some("working")).unwrap();

        let info = handle.job_info();
        assert_eq!(info.progress, Some(10));
        assert_eq!(info.message.as_deref(), Some("working"));

        handle.report_progress(Some(30), None).unwrap();
        let info = handle.job_info();
        assert_eq!(info.progress, Some(30));
        assert_eq!(info.message.as_deref(), Some("working"));
    }

    #[test]
    fn progress_is_clamped() {
        let handle = handle();
        handle.report_progress(Some(250), None).unwrap();
        assert_eq!(handle.job_info().progress, Some(100));
    }

    #[test]
    fn updated_is_monotonic() {
        let handle = handle();
        let mut last = handle.job_info().updated;
        for i in 0..20 {
            handle.report_progress(Some(i), None).unwrap();
            let updated = handle.job_info().updated;
            assert!(updated >= last);
            last = updated;
        }
    }

    #[test]
    fn cancelled_progress_fails_without_changes() {
        let handle = handle();
        handle.report_progress(Some(20), Some("before")).unwrap();
        let before = handle.job_info();

        handle.clone().cancel();
        assert!(handle.is_cancelled());

        let err = handle.report_progress(Some(80), Some("after")).unwrap_err();
        assert!(is_cancellation(&err));
        assert_eq!(handle.job_info(), before);
        assert!(handle.check_cancelled().is_err());
    }

    #[test]
    fn no_reporter_without_subscriber() {
        let handle = handle();
        handle.report_progress(Some(5), None).unwrap();
        assert!(handle.state.reporter.get().is_none());
    }
}
