use std::sync::Arc;

use ahash::HashMap;
use crucible_process::ProcessRegistry;
use error_stack::{Report, ResultExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{event, instrument, Level};

use crate::{
    job::{Job, JobOptions},
    reporter::ReporterConfig,
    request::ExecuteRequest,
    status::{JobInfo, JobResults},
};


#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no process with ID `{0}`")]
    UnknownProcess(String),
    #[error("invalid inputs for process `{0}`")]
    InvalidInputs(String),
    #[error("no job with ID `{0}`")]
    UnknownJob(String),
    #[error("the worker running the job exited unexpectedly")]
    WorkerLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// The maximum number of jobs to run at once. Jobs beyond this wait in the `accepted`
    /// state. Unlimited if not set.
    pub max_concurrent_jobs: Option<usize>,
    /// Settings for delivering notifications to job subscribers.
    pub reporter: ReporterConfig,
}

/// Runs jobs for the processes in a registry and keeps track of them.
///
/// Process functions are synchronous, so each job runs on Tokio's blocking thread pool. The
/// manager's async methods must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct JobManager {
    registry: Arc<ProcessRegistry>,
    jobs: Arc<RwLock<HashMap<String, Arc<Job>>>>,
    semaphore: Arc<Semaphore>,
    config: ManagerConfig,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("processes", &self.registry.len())
            .field("jobs", &self.jobs.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl JobManager {
    pub fn new(registry: ProcessRegistry, config: ManagerConfig) -> Self {
        let max_concurrent_jobs = config
            .max_concurrent_jobs
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);

        Self {
            registry: Arc::new(registry),
            jobs: Arc::new(RwLock::new(HashMap::default())),
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
            config,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    fn create_job(
        &self,
        process_id: &str,
        request: ExecuteRequest,
    ) -> Result<Arc<Job>, Report<ManagerError>> {
        let process = self
            .registry
            .get(process_id)
            .ok_or_else(|| Report::new(ManagerError::UnknownProcess(process_id.to_string())))?;

        let job = Job::create_with(
            process,
            request,
            JobOptions {
                job_id: None,
                reporter: self.config.reporter.clone(),
            },
        )
        .change_context_lazy(|| ManagerError::InvalidInputs(process_id.to_string()))?;

        let job = Arc::new(job);
        self.jobs.write().insert(job.id().to_string(), job.clone());
        Ok(job)
    }

    fn spawn(&self, job: Arc<Job>) -> JoinHandle<Result<Option<JobResults>, Report<ManagerError>>> {
        let semaphore = self.semaphore.clone();
        tokio::task::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .change_context(ManagerError::WorkerLost)?;

            tokio::task::spawn_blocking(move || job.run())
                .await
                .change_context(ManagerError::WorkerLost)
        })
    }

    /// Start a job in the background and return its initial status.
    #[instrument(skip(self, request))]
    pub async fn submit(
        &self,
        process_id: &str,
        request: ExecuteRequest,
    ) -> Result<JobInfo, Report<ManagerError>> {
        let job = self.create_job(process_id, request)?;
        let info = job.job_info();
        event!(Level::INFO, job = %info.job_id, "Submitted job");
        self.spawn(job);
        Ok(info)
    }

    /// Run a job to completion and return its final status, along with its results if it
    /// succeeded.
    #[instrument(skip(self, request))]
    pub async fn execute(
        &self,
        process_id: &str,
        request: ExecuteRequest,
    ) -> Result<(JobInfo, Option<JobResults>), Report<ManagerError>> {
        let job = self.create_job(process_id, request)?;
        let results = self
            .spawn(job.clone())
            .await
            .change_context(ManagerError::WorkerLost)??;
        Ok((job.job_info(), results))
    }

    pub fn status(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.read().get(job_id).map(|job| job.job_info())
    }

    pub fn results(&self, job_id: &str) -> Option<JobResults> {
        self.jobs.read().get(job_id).and_then(|job| job.results())
    }

    /// Dismiss a job and return its status as of the call.
    ///
    /// A job that is still accepted or running is asked to cancel and stays listed, so that
    /// its move to `dismissed` can be observed. A job that already finished is removed along
    /// with its results, after which the manager no longer knows its ID.
    #[instrument(skip(self))]
    pub fn dismiss(&self, job_id: &str) -> Result<JobInfo, Report<ManagerError>> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| Report::new(ManagerError::UnknownJob(job_id.to_string())))?;

        let info = job.job_info();
        if info.status.is_terminal() {
            jobs.remove(job_id);
            event!(Level::DEBUG, job = %job_id, status = ?info.status, "Removed finished job");
        } else {
            drop(jobs);
            job.cancel();
        }
        Ok(info)
    }

    /// The status of every job, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs = self
            .jobs
            .read()
            .values()
            .map(|job| job.job_info())
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }
}
