//! Drive one external asynchronous job from submission to output rows.
//!
//! Providers are reached through the narrow [`JobService`] contract
//! (submit, poll, fetch). [`RemoteJobClient`] adds the parts every provider
//! needs: a bounded polling loop and an ordered fallback over the
//! provider's result-retrieval strategies.

mod apify;

pub use apify::ApifyJobService;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::error::{JobError, ServiceError};

/// Stand-in deadline for budgets too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// One output row of a remote job, opaque to the core.
pub type Row = serde_json::Value;

/// What to run remotely: a provider program (actor) and its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub program: String,
    pub input: serde_json::Value,
    /// Tried in order when `program` is unavailable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_programs: Vec<String>,
}

impl JobSpec {
    pub fn new(program: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            program: program.into(),
            input,
            fallback_programs: Vec::new(),
        }
    }

    pub fn with_fallbacks<I, P>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.fallback_programs = programs.into_iter().map(Into::into).collect();
        self
    }

    /// `program` followed by its fallbacks.
    pub fn programs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.fallback_programs.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
            JobState::TimedOut => "timed_out",
        }
    }

    /// Terminal jobs are never polled again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Submitted | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted job, alive for the duration of one [`RemoteJobClient::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJob {
    pub job_id: String,
    pub state: JobState,
    /// Where results live once the job succeeded, if the provider said so
    pub dataset_ref: Option<String>,
    /// Provider key-value storage attached to the run
    pub key_value_store_ref: Option<String>,
}

impl RemoteJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Submitted,
            dataset_ref: None,
            key_value_store_ref: None,
        }
    }
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusReport {
    pub state: JobState,
    /// Provider-supplied explanation, mostly useful on failure
    pub message: Option<String>,
    pub dataset_ref: Option<String>,
}

impl JobStatusReport {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            message: None,
            dataset_ref: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One way of retrieving a finished job's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    /// The job's default result collection
    RunDefaultDataset,
    /// Re-read job metadata for an explicit dataset reference, then read that dataset
    RunMetadataDataset,
    /// A fixed well-known storage slot
    WellKnownRecord,
}

impl FetchStrategy {
    /// Order used unless configured otherwise.
    pub const DEFAULT_ORDER: [FetchStrategy; 3] = [
        FetchStrategy::RunDefaultDataset,
        FetchStrategy::RunMetadataDataset,
        FetchStrategy::WellKnownRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::RunDefaultDataset => "run_default_dataset",
            FetchStrategy::RunMetadataDataset => "run_metadata_dataset",
            FetchStrategy::WellKnownRecord => "well_known_record",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submit/poll/fetch contract of an external job provider.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJob, ServiceError>;

    async fn poll(&self, job: &RemoteJob) -> Result<JobStatusReport, ServiceError>;

    /// Retrieve rows with one strategy. An empty vec means "nothing here".
    async fn fetch(&self, job: &RemoteJob, strategy: FetchStrategy)
        -> Result<Vec<Row>, ServiceError>;
}

/// Runs remote jobs to completion with a wall-clock budget.
pub struct RemoteJobClient<S: JobService + ?Sized> {
    service: Arc<S>,
    config: PollConfig,
}

impl<S: JobService + ?Sized> Clone for RemoteJobClient<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            config: self.config.clone(),
        }
    }
}

impl<S: JobService + ?Sized> RemoteJobClient<S> {
    pub fn new(service: Arc<S>, config: PollConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Run with the configured `max_wait`.
    pub async fn run_default(&self, spec: &JobSpec) -> Result<Vec<Row>, JobError> {
        self.run(spec, self.config.max_wait).await
    }

    /// Submit `spec`, wait for a terminal state and fetch the rows, all within `max_wait`.
    ///
    /// A [`JobError::TimedOut`] leaves the remote job running; its outcome is unknown.
    pub async fn run(&self, spec: &JobSpec, max_wait: Duration) -> Result<Vec<Row>, JobError> {
        let budget = Budget::new(max_wait);

        let mut job = match tokio::time::timeout(budget.remaining(), self.service.submit(spec)).await {
            Err(_) => {
                warn!(program = %spec.program, "remote job submission did not answer in time");
                return Err(budget.timed_out(None));
            }
            Ok(submitted) => submitted.map_err(|e| JobError::Submission(e.to_string()))?,
        };

        info!(job_id = %job.job_id, program = %spec.program, "remote job submitted");

        self.wait_for_completion(&mut job, &budget).await?;
        let rows = self.fetch_rows(&job, &budget).await?;

        let fetched = rows.len();
        let rows = drop_error_rows(rows);
        if rows.len() < fetched {
            debug!(
                job_id = %job.job_id,
                dropped = fetched - rows.len(),
                "dropped rows carrying an error marker"
            );
        }

        Ok(rows)
    }

    async fn wait_for_completion(&self, job: &mut RemoteJob, budget: &Budget) -> Result<(), JobError> {
        loop {
            let remaining = budget.remaining();
            if remaining.is_zero() {
                return Err(budget.timed_out(Some(&job.job_id)));
            }

            match tokio::time::timeout(remaining, self.service.poll(job)).await {
                Err(_) => return Err(budget.timed_out(Some(&job.job_id))),
                Ok(Err(e)) => {
                    warn!(job_id = %job.job_id, error = %e, "status poll failed, will retry");
                }
                Ok(Ok(report)) => {
                    job.state = report.state;
                    if report.dataset_ref.is_some() {
                        job.dataset_ref = report.dataset_ref;
                    }

                    match report.state {
                        JobState::Succeeded => {
                            info!(job_id = %job.job_id, elapsed = ?budget.elapsed(), "remote job succeeded");
                            return Ok(());
                        }
                        state if state.is_terminal() => {
                            let message = report.message.unwrap_or_else(|| state.to_string());
                            warn!(job_id = %job.job_id, %state, %message, "remote job failed");
                            return Err(JobError::RemoteFailure {
                                job_id: job.job_id.clone(),
                                state,
                                message,
                            });
                        }
                        state => debug!(job_id = %job.job_id, %state, "remote job still running"),
                    }
                }
            }

            let remaining = budget.remaining();
            if remaining.is_zero() {
                return Err(budget.timed_out(Some(&job.job_id)));
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    async fn fetch_rows(&self, job: &RemoteJob, budget: &Budget) -> Result<Vec<Row>, JobError> {
        for &strategy in &self.config.fetch_order {
            let fetched = tokio::time::timeout(budget.remaining(), self.service.fetch(job, strategy)).await;
            match fetched {
                Err(_) => {
                    warn!(job_id = %job.job_id, %strategy, "ran out of time while fetching rows");
                    return Err(budget.timed_out(Some(&job.job_id)));
                }
                Ok(Ok(rows)) if !rows.is_empty() => {
                    info!(job_id = %job.job_id, %strategy, rows = rows.len(), "fetched job rows");
                    return Ok(rows);
                }
                Ok(Ok(_)) => {
                    debug!(job_id = %job.job_id, %strategy, "fetch strategy returned no rows");
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job.job_id, %strategy, error = %e, "fetch strategy failed");
                }
            }
        }

        Err(JobError::FetchExhausted {
            job_id: job.job_id.clone(),
        })
    }
}

/// Wall-clock allowance shared by every step of one run.
struct Budget {
    started: Instant,
    deadline: Instant,
}

impl Budget {
    fn new(max_wait: Duration) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(max_wait)
            .unwrap_or_else(|| started + FAR_FUTURE);
        Self { started, deadline }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn timed_out(&self, job_id: Option<&str>) -> JobError {
        JobError::TimedOut {
            job_id: job_id.map(str::to_string),
            waited: self.elapsed(),
        }
    }
}

/// Drop rows whose `error` field is truthy.
pub fn drop_error_rows(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| !row.get("error").is_some_and(is_truthy))
        .collect()
}

fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;

    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
