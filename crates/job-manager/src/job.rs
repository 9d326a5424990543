use std::{
    any::Any,
    panic::{AssertUnwindSafe, Location},
};

use crucible_process::{is_cancellation, Arguments, JobContext, JobError, Process, ValidationError};
use error_stack::{AttachmentKind, FrameKind, Report};
use serde_json::{Map, Value};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::{
    handle::JobHandle,
    reporter::ReporterConfig,
    request::{ExecuteRequest, Notification},
    status::{JobInfo, JobResults, JobStatus},
};

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Use this ID instead of generating one.
    pub job_id: Option<String>,
    pub reporter: ReporterConfig,
}

enum Outcome {
    Success(Value),
    Cancelled,
    Failed {
        message: String,
        traceback: Vec<String>,
    },
}

impl Outcome {
    fn failed(report: &Report<JobError>) -> Self {
        Outcome::Failed {
            message: report.current_context().to_string(),
            traceback: traceback(report),
        }
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "process function panicked".to_string());

        Outcome::Failed {
            traceback: vec![format!("panicked: {message}")],
            message,
        }
    }
}

/// The error chain of a report, outermost context first, with the source location of each
/// context.
fn traceback(report: &Report<JobError>) -> Vec<String> {
    report
        .frames()
        .filter_map(|frame| match frame.kind() {
            FrameKind::Context(context) => Some(context.to_string()),
            FrameKind::Attachment(AttachmentKind::Printable(attachment)) => {
                Some(format!("  {attachment}"))
            }
            _ => frame
                .downcast_ref::<Location<'static>>()
                .map(|location| format!("    at {location}")),
        })
        .collect()
}

/// One execution of a process with a validated set of inputs.
pub struct Job {
    process: Process,
    kwargs: Map<String, Value>,
    handle: JobHandle,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("process", &self.process.id())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Validate the request's inputs against the process and create an `accepted` job.
    pub fn create(
        process: &Process,
        request: ExecuteRequest,
        job_id: Option<String>,
    ) -> Result<Job, Report<ValidationError>> {
        Self::create_with(
            process,
            request,
            JobOptions {
                job_id,
                ..Default::default()
            },
        )
    }

    #[instrument(skip_all, fields(process = %process.id()))]
    pub fn create_with(
        process: &Process,
        request: ExecuteRequest,
        options: JobOptions,
    ) -> Result<Job, Report<ValidationError>> {
        let kwargs = process.input_model().validate(&request.inputs)?;
        let job_id = options
            .job_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        event!(Level::DEBUG, job = %job_id, "Accepted job");
        let info = JobInfo::accepted(process.id(), &job_id);
        let handle = JobHandle::new(
            info,
            request.subscriber.unwrap_or_default(),
            options.reporter,
        );

        Ok(Job {
            process: process.clone(),
            kwargs,
            handle,
        })
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// The validated arguments the process function will be called with.
    pub fn function_kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// A handle that shares this job's state.
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn job_info(&self) -> JobInfo {
        self.handle.job_info()
    }

    pub fn results(&self) -> Option<JobResults> {
        self.handle.results()
    }

    pub fn cancel(&self) {
        self.handle.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn report_progress(
        &self,
        progress: Option<u8>,
        message: Option<&str>,
    ) -> Result<(), Report<JobError>> {
        self.handle.report_progress(progress, message)
    }

    /// Run the process function on the current thread and record the outcome. Returns the
    /// results if the job succeeded.
    ///
    /// Errors from the function don't propagate. They mark the job `failed`, or `dismissed`
    /// when the error is a cancellation. A job can only run once; later calls return `None`
    /// and leave the job alone.
    #[instrument(skip(self), fields(job = %self.id(), process = %self.process.id()))]
    pub fn run(&self) -> Option<JobResults> {
        let started = self.handle.update(|info| {
            if !info.status.can_transition_to(JobStatus::Running) {
                return false;
            }
            info.status = JobStatus::Running;
            info.started = Some(info.updated);
            true
        });

        if !started {
            event!(Level::WARN, "Job was already run");
            return None;
        }

        let outcome = if self.handle.is_cancelled() {
            Outcome::Cancelled
        } else {
            event!(Level::INFO, "Running job");
            let args = Arguments::new(self.kwargs.clone());
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.process.call(&self.handle, args)
            }));

            match result {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(report)) if is_cancellation(&report) => Outcome::Cancelled,
                Ok(Err(report)) => Outcome::failed(&report),
                Err(payload) => Outcome::panicked(payload.as_ref()),
            }
        };

        let results = match outcome {
            Outcome::Success(value) => {
                match JobResults::from_return_value(self.process.output_names(), value) {
                    Ok(results) => {
                        self.succeed(results.clone());
                        Some(results)
                    }
                    Err(report) => {
                        self.fail(report.current_context().to_string(), traceback(&report));
                        None
                    }
                }
            }
            Outcome::Cancelled => {
                self.dismiss();
                None
            }
            Outcome::Failed { message, traceback } => {
                self.fail(message, traceback);
                None
            }
        };

        self.handle.close_reporter();
        results
    }

    fn succeed(&self, results: JobResults) {
        // Results go in first so that anyone who sees the successful status can read them.
        self.handle.set_results(results.clone());
        self.handle.update(|info| {
            info.status = JobStatus::Successful;
            info.progress = Some(100);
            info.finished = Some(info.updated);
        });

        event!(Level::INFO, "Job succeeded");
        self.handle.notify(Notification::Success, &results);
    }

    fn fail(&self, message: String, traceback: Vec<String>) {
        let info = self.handle.update(|info| {
            info.status = JobStatus::Failed;
            info.message = Some(message);
            info.traceback = Some(traceback);
            info.finished = Some(info.updated);
            info.clone()
        });

        event!(Level::ERROR, message = ?info.message, "Job failed");
        self.handle.notify(Notification::Failed, &info);
    }

    fn dismiss(&self) {
        let info = self.handle.update(|info| {
            info.status = JobStatus::Dismissed;
            info.finished = Some(info.updated);
            info.clone()
        });

        event!(Level::INFO, "Job dismissed");
        self.handle.notify(Notification::Failed, &info);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crucible_process::{FieldMeta, ProcessBuilder};
    use httpmock::prelude::*;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::{request::Subscriber, test_util::setup_test_tracing};

    fn greet_process() -> Process {
        ProcessBuilder::new("greet")
            .param::<i64>("x")
            .param_with_default("y", "hi".to_string())
            .build(|_ctx: &dyn JobContext, args: Arguments| {
                let x = args.get::<i64>("x")?;
                let y = args.get::<String>("y")?;
                Ok(format!("{y} {x}"))
            })
            .unwrap()
    }

    fn boom_process() -> Process {
        ProcessBuilder::new("boom")
            .job_context("ctx")
            .build(|ctx: &dyn JobContext, _args: Arguments| -> Result<(), Report<JobError>> {
                ctx.report_progress(Some(50), Some("halfway"))?;
                Err(Report::new(JobError::failed("boom")))
            })
            .unwrap()
    }

    fn request(inputs: Value) -> ExecuteRequest {
        serde_json::from_value(json!({ "inputs": inputs })).unwrap()
    }

    fn wait_for_hits(mock: &httpmock::Mock, hits: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while mock.hits() < hits && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn successful_run() {
        setup_test_tracing();
        let job = Job::create(&greet_process(), request(json!({ "x": 3 })), None).unwrap();
        assert_eq!(job.function_kwargs()["y"], json!("hi"));

        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Accepted);
        assert_eq!(info.process_id, "greet");
        assert!(info.started.is_none());

        let results = job.run().unwrap();
        assert_eq!(results.get("return_value"), Some(&json!("hi 3")));
        assert_eq!(job.results(), Some(results));

        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Successful);
        assert_eq!(info.progress, Some(100));
        let started = info.started.unwrap();
        let finished = info.finished.unwrap();
        assert!(info.created <= started);
        assert!(started <= finished);
        assert_eq!(info.updated, finished);
    }

    #[test]
    fn explicit_job_id() {
        let job = Job::create(
            &greet_process(),
            request(json!({ "x": 1 })),
            Some("my-job".to_string()),
        )
        .unwrap();
        assert_eq!(job.id(), "my-job");
        assert_eq!(job.job_info().job_id, "my-job");
    }

    #[test]
    fn generated_ids_are_unique() {
        let process = greet_process();
        let a = Job::create(&process, request(json!({ "x": 1 })), None).unwrap();
        let b = Job::create(&process, request(json!({ "x": 1 })), None).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn invalid_inputs_rejected() {
        let err = Job::create(&greet_process(), request(json!({ "x": "three" })), None)
            .unwrap_err();
        let fields = err
            .current_context()
            .errors
            .iter()
            .map(|e| e.field.as_str())
            .collect::<Vec<_>>();
        assert_eq!(fields, vec!["x"]);
    }

    #[test]
    fn failing_run() {
        setup_test_tracing();
        let job = Job::create(&boom_process(), ExecuteRequest::default(), None).unwrap();
        assert!(job.run().is_none());

        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.message.as_deref(), Some("boom"));
        assert_eq!(info.progress, Some(50));
        assert!(info.finished.is_some());
        let traceback = info.traceback.unwrap();
        assert!(!traceback.is_empty());
        assert_eq!(traceback[0], "boom");
        assert!(job.results().is_none());
    }

    #[test]
    fn panicking_run() {
        let process = ProcessBuilder::new("panics")
            .build(|_ctx: &dyn JobContext, _args: Arguments| -> Result<(), Report<JobError>> {
                panic!("exploded")
            })
            .unwrap();

        let job = Job::create(&process, ExecuteRequest::default(), None).unwrap();
        assert!(job.run().is_none());

        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.message.as_deref(), Some("exploded"));
        assert!(!info.traceback.unwrap().is_empty());
    }

    #[test]
    fn tuple_outputs() {
        let process = ProcessBuilder::new("divmod")
            .param::<i64>("a")
            .param::<i64>("b")
            .output("quotient", FieldMeta::new())
            .output("remainder", FieldMeta::new().title("Remainder"))
            .build(|_ctx: &dyn JobContext, args: Arguments| {
                let a = args.get::<i64>("a")?;
                let b = args.get::<i64>("b")?;
                Ok((a / b, a % b))
            })
            .unwrap();

        let job = Job::create(&process, request(json!({ "a": 7, "b": 2 })), None).unwrap();
        let results = job.run().unwrap();
        assert_eq!(
            serde_json::to_value(&results).unwrap(),
            json!({ "quotient": 3, "remainder": 1 })
        );
    }

    #[test]
    fn cancelled_while_running() {
        let process = ProcessBuilder::new("loop")
            .job_context("ctx")
            .build(|ctx: &dyn JobContext, _args: Arguments| -> Result<(), Report<JobError>> {
                loop {
                    ctx.report_progress(Some(10), None)?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        let job = Arc::new(Job::create(&process, ExecuteRequest::default(), None).unwrap());
        let handle = job.handle();
        let runner = std::thread::spawn({
            let job = job.clone();
            move || job.run()
        });

        while handle.status() != JobStatus::Running {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();

        assert!(runner.join().unwrap().is_none());
        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Dismissed);
        assert!(info.finished.is_some());
        assert!(info.traceback.is_none());
    }

    #[test]
    fn cancelled_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let process = ProcessBuilder::new("counted")
            .build({
                let calls = calls.clone();
                move |_ctx: &dyn JobContext, _args: Arguments| -> Result<(), Report<JobError>> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let job = Job::create(&process, ExecuteRequest::default(), None).unwrap();
        job.cancel();
        assert!(job.is_cancelled());
        assert!(job.run().is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let info = job.job_info();
        assert_eq!(info.status, JobStatus::Dismissed);
        assert!(info.started.is_some());
        assert!(info.finished.is_some());
    }

    #[test]
    fn runs_only_once() {
        let job = Job::create(&greet_process(), request(json!({ "x": 2 })), None).unwrap();
        assert!(job.run().is_some());
        let info = job.job_info();

        assert!(job.run().is_none());
        assert_eq!(job.job_info().status, info.status);
        assert_eq!(job.job_info().finished, info.finished);
    }

    #[test]
    fn progress_reported_outside_run() {
        let job = Job::create(&greet_process(), request(json!({ "x": 2 })), None).unwrap();
        job.report_progress(Some(40), Some("queued")).unwrap();
        assert_eq!(job.job_info().progress, Some(40));

        job.cancel();
        assert!(job.report_progress(Some(60), None).is_err());
        assert_eq!(job.job_info().progress, Some(40));
    }

    #[test]
    fn notifies_success_uri() {
        setup_test_tracing();
        let server = MockServer::start();
        let success = server.mock(|when, then| {
            when.method(POST)
                .path("/success")
                .json_body(json!({ "return_value": "hi 3" }));
            then.status(200);
        });
        let failed = server.mock(|when, then| {
            when.method(POST).path("/failed");
            then.status(200);
        });

        let subscriber = Subscriber {
            success_uri: Some(Url::parse(&server.url("/success")).unwrap()),
            failed_uri: Some(Url::parse(&server.url("/failed")).unwrap()),
            in_progress_uri: None,
        };
        let job = Job::create(
            &greet_process(),
            request(json!({ "x": 3 })).subscriber(subscriber),
            None,
        )
        .unwrap();
        job.run().unwrap();
        job.handle().wait_for_notifications();

        success.assert_hits(1);
        failed.assert_hits(0);
    }

    #[test]
    fn notifies_failed_uri() {
        let server = MockServer::start();
        let failed = server.mock(|when, then| {
            when.method(POST)
                .path("/failed")
                .json_body_partial(r#"{ "status": "failed", "message": "boom" }"#);
            then.status(200);
        });

        let subscriber = Subscriber {
            failed_uri: Some(Url::parse(&server.url("/failed")).unwrap()),
            ..Default::default()
        };
        let job = Job::create_with(
            &boom_process(),
            ExecuteRequest::default().subscriber(subscriber),
            JobOptions {
                job_id: Some("boom-1".to_string()),
                reporter: ReporterConfig {
                    poll_interval_ms: 10,
                    ..Default::default()
                },
            },
        )
        .unwrap();
        job.run();

        wait_for_hits(&failed, 1);
        failed.assert_hits(1);
    }

    #[test]
    fn notifies_progress() {
        let server = MockServer::start();
        let progress = server.mock(|when, then| {
            when.method(POST)
                .path("/progress")
                .json_body_partial(r#"{ "status": "accepted", "progress": 25 }"#);
            then.status(200);
        });

        let subscriber = Subscriber {
            in_progress_uri: Some(Url::parse(&server.url("/progress")).unwrap()),
            ..Default::default()
        };
        let job = Job::create(
            &greet_process(),
            request(json!({ "x": 3 })).subscriber(subscriber),
            None,
        )
        .unwrap();
        job.report_progress(Some(25), None).unwrap();
        job.handle().wait_for_notifications();

        progress.assert_hits(1);
    }
}
