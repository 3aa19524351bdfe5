//! Typed errors for the orchestration core.
//!
//! Each component has its own error so callers can decide what is worth
//! retrying without string matching:
//! - [`JobError`] for a single remote job run
//! - [`StoreError`] for work item bookkeeping
//! - [`ExtractionError`] for one extraction attempt
//! - [`Error`] for the composed entry points

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::remote::JobState;
use crate::types::{ErrorKind, WorkStatus};

/// Failure of a single remote job run.
#[derive(Debug, Error)]
pub enum JobError {
    /// The provider rejected the submission. Not retried for the same spec.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// The provider reported a terminal failure for the job.
    #[error("remote job {job_id} ended as {state}: {message}")]
    RemoteFailure {
        job_id: String,
        state: JobState,
        message: String,
    },

    /// The wall-clock budget ran out before rows were in hand.
    ///
    /// The remote job may keep running; the outcome is unknown. `job_id`
    /// is `None` when the submission itself never answered.
    #[error(
        "remote job {} not finished after {waited:?}",
        .job_id.as_deref().unwrap_or("(unsubmitted)")
    )]
    TimedOut {
        job_id: Option<String>,
        waited: Duration,
    },

    /// The job succeeded but no fetch strategy returned any rows.
    #[error("no fetch strategy returned rows for job {job_id}")]
    FetchExhausted { job_id: String },
}

impl JobError {
    /// Timeouts and empty fetches may resolve on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::TimedOut { .. } | JobError::FetchExhausted { .. })
    }
}

/// Error from a [`JobService`](crate::remote::JobService) call.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Apify(#[from] apify_client::ApifyError),

    #[error("{0}")]
    Other(String),
}

/// Errors from a [`WorkStore`](crate::store::WorkStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("work item not found: {0}")]
    NotFound(Uuid),

    /// The item is not in a state that allows the requested change.
    #[error("cannot {action} work item {id} while it is {status}")]
    InvalidTransition {
        id: Uuid,
        status: WorkStatus,
        action: &'static str,
    },

    /// A stored row could not be decoded.
    #[error("corrupt work item row: {0}")]
    Corrupt(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of one extraction attempt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtractionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NonRetryable,
            message: message.into(),
        }
    }
}

impl From<JobError> for ExtractionError {
    fn from(err: JobError) -> Self {
        if err.is_transient() {
            Self::retryable(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }
}

impl From<openrouter_client::OpenRouterError> for ExtractionError {
    fn from(err: openrouter_client::OpenRouterError) -> Self {
        match err {
            // Unparseable replies vary run to run
            openrouter_client::OpenRouterError::Parse(_) => Self::retryable(err.to_string()),
            _ if err.is_transient() => Self::retryable(err.to_string()),
            _ => Self::permanent(err.to_string()),
        }
    }
}

/// Crate-level error for the composed entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for the composed entry points.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_job_errors_become_retryable() {
        let timed_out = JobError::TimedOut {
            job_id: Some("run".into()),
            waited: Duration::from_secs(300),
        };
        assert_eq!(ExtractionError::from(timed_out).kind, ErrorKind::Retryable);

        let exhausted = JobError::FetchExhausted { job_id: "run".into() };
        assert_eq!(ExtractionError::from(exhausted).kind, ErrorKind::Retryable);
    }

    #[test]
    fn test_deterministic_job_errors_are_permanent() {
        let rejected = JobError::Submission("HTTP 400".into());
        assert_eq!(ExtractionError::from(rejected).kind, ErrorKind::NonRetryable);

        let failed = JobError::RemoteFailure {
            job_id: "run".into(),
            state: JobState::Failed,
            message: "actor crashed".into(),
        };
        let err = ExtractionError::from(failed);
        assert_eq!(err.kind, ErrorKind::NonRetryable);
        assert!(err.message.contains("actor crashed"));
    }
}
