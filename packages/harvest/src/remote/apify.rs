//! [`JobService`] over the Apify actor API.

use apify_client::{ApifyClient, RunData, RunStatus};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{FetchStrategy, JobService, JobSpec, JobState, JobStatusReport, RemoteJob, Row};
use crate::error::ServiceError;

/// Key of the record actors write their output to when they skip the dataset.
const OUTPUT_RECORD_KEY: &str = "OUTPUT";
const DEFAULT_KEY_VALUE_STORE: &str = "default";

/// Apify actors as remote jobs.
#[derive(Clone)]
pub struct ApifyJobService {
    client: ApifyClient,
}

impl ApifyJobService {
    pub fn new(client: ApifyClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApifyClient {
        &self.client
    }

    /// First program of `spec` whose actor passes the availability check.
    async fn first_available<'a>(&self, spec: &'a JobSpec) -> Result<&'a str, ServiceError> {
        for actor_id in spec.programs() {
            match self.client.actor_exists(actor_id).await {
                Ok(true) => {
                    debug!(actor_id, "using available actor");
                    return Ok(actor_id);
                }
                Ok(false) => warn!(actor_id, "actor not available"),
                Err(e) => warn!(actor_id, error = %e, "actor availability check failed"),
            }
        }

        Err(ServiceError::Other(format!(
            "no available actor among {}",
            spec.programs().collect::<Vec<_>>().join(", ")
        )))
    }
}

fn job_state(status: RunStatus) -> JobState {
    match status {
        RunStatus::Ready => JobState::Submitted,
        RunStatus::Succeeded => JobState::Succeeded,
        RunStatus::Failed => JobState::Failed,
        RunStatus::Aborted => JobState::Aborted,
        RunStatus::TimedOut => JobState::TimedOut,
        RunStatus::Running | RunStatus::Aborting | RunStatus::TimingOut | RunStatus::Unknown => {
            JobState::Running
        }
    }
}

fn remote_job(run: RunData) -> RemoteJob {
    RemoteJob {
        job_id: run.id,
        state: job_state(run.status),
        dataset_ref: run.default_dataset_id,
        key_value_store_ref: run.default_key_value_store_id,
    }
}

/// Rows from an `OUTPUT` record: either a bare array or `{"items": [...]}`.
fn record_rows(record: Value) -> Vec<Row> {
    match record {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl JobService for ApifyJobService {
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJob, ServiceError> {
        // A lone program is started without the availability round trip
        let actor_id = if spec.fallback_programs.is_empty() {
            spec.program.as_str()
        } else {
            self.first_available(spec).await?
        };
        let run = self.client.start_run(actor_id, &spec.input).await?;
        Ok(remote_job(run))
    }

    async fn poll(&self, job: &RemoteJob) -> Result<JobStatusReport, ServiceError> {
        let run = self.client.get_run(&job.job_id).await?;
        Ok(JobStatusReport {
            state: job_state(run.status),
            message: run.status_message,
            dataset_ref: run.default_dataset_id,
        })
    }

    async fn fetch(&self, job: &RemoteJob, strategy: FetchStrategy) -> Result<Vec<Row>, ServiceError> {
        match strategy {
            FetchStrategy::RunDefaultDataset => {
                Ok(self.client.run_dataset_items(&job.job_id).await?)
            }
            FetchStrategy::RunMetadataDataset => {
                let run = self.client.get_run(&job.job_id).await?;
                let Some(dataset_id) = run.default_dataset_id.or_else(|| job.dataset_ref.clone())
                else {
                    debug!(job_id = %job.job_id, "run has no dataset reference");
                    return Ok(Vec::new());
                };
                Ok(self.client.dataset_items(&dataset_id).await?)
            }
            FetchStrategy::WellKnownRecord => {
                let store_id = job
                    .key_value_store_ref
                    .as_deref()
                    .unwrap_or(DEFAULT_KEY_VALUE_STORE);
                let record = self
                    .client
                    .key_value_record(store_id, OUTPUT_RECORD_KEY)
                    .await?;
                Ok(record.map(record_rows).unwrap_or_default())
            }
        }
    }
}
