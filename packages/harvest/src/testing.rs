//! Testing utilities including fake implementations.
//!
//! These are useful for testing code built on the engine and the remote job
//! client without network calls or real providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::engine::Extractor;
use crate::error::{ExtractionError, ServiceError};
use crate::observer::ProgressObserver;
use crate::remote::{FetchStrategy, JobService, JobSpec, JobState, JobStatusReport, RemoteJob, Row};
use crate::types::{ErrorKind, WorkInput};

// ============================================================================
// FakeJobService
// ============================================================================

/// A scripted [`JobService`].
///
/// Poll responses are served in the order they were added; once the script
/// runs out the last response repeats. Strategies without scripted rows
/// return nothing.
#[derive(Default)]
pub struct FakeJobService {
    /// Poll responses in order
    script: RwLock<Vec<Result<JobStatusReport, String>>>,

    /// Rows (or an error) per fetch strategy
    rows: RwLock<HashMap<FetchStrategy, Result<Vec<Row>, String>>>,

    /// Reject every submission with this message
    submit_error: Option<String>,

    /// Delay before answering each submit, poll or fetch
    submit_delay: Option<Duration>,
    poll_delay: Option<Duration>,
    fetch_delay: Option<Duration>,

    polls: AtomicUsize,

    /// Call tracking for assertions
    calls: RwLock<Vec<FakeJobCall>>,
}

/// Record of a call made to the fake service.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeJobCall {
    Submit(JobSpec),
    Poll { job_id: String },
    Fetch(FetchStrategy),
}

impl FakeJobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one poll response per state.
    pub fn with_states(self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.script
            .write()
            .unwrap()
            .extend(states.into_iter().map(|s| Ok(JobStatusReport::new(s))));
        self
    }

    /// Append a full poll report.
    pub fn with_report(self, report: JobStatusReport) -> Self {
        self.script.write().unwrap().push(Ok(report));
        self
    }

    /// Append a failing poll.
    pub fn with_poll_error(self, message: impl Into<String>) -> Self {
        self.script.write().unwrap().push(Err(message.into()));
        self
    }

    pub fn with_rows(self, strategy: FetchStrategy, rows: Vec<Row>) -> Self {
        self.rows.write().unwrap().insert(strategy, Ok(rows));
        self
    }

    pub fn with_fetch_error(self, strategy: FetchStrategy, message: impl Into<String>) -> Self {
        self.rows
            .write()
            .unwrap()
            .insert(strategy, Err(message.into()));
        self
    }

    pub fn failing_submit(mut self, message: impl Into<String>) -> Self {
        self.submit_error = Some(message.into());
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Get all calls made to this fake.
    pub fn calls(&self) -> Vec<FakeJobCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FakeJobCall::Submit(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn fetches(&self) -> Vec<FetchStrategy> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FakeJobCall::Fetch(strategy) => Some(strategy),
                _ => None,
            })
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn record(&self, call: FakeJobCall) {
        self.calls.write().unwrap().push(call);
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJob, ServiceError> {
        self.record(FakeJobCall::Submit(spec.clone()));
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.submit_error {
            return Err(ServiceError::Other(message.clone()));
        }
        let n = self.submitted().len();
        Ok(RemoteJob::new(format!("fake-run-{}", n)))
    }

    async fn poll(&self, job: &RemoteJob) -> Result<JobStatusReport, ServiceError> {
        self.record(FakeJobCall::Poll {
            job_id: job.job_id.clone(),
        });
        let index = self.polls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }

        let response = {
            let script = self.script.read().unwrap();
            script.get(index).or_else(|| script.last()).cloned()
        };
        match response {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(ServiceError::Other(message)),
            None => Ok(JobStatusReport::new(JobState::Running)),
        }
    }

    async fn fetch(&self, _job: &RemoteJob, strategy: FetchStrategy) -> Result<Vec<Row>, ServiceError> {
        self.record(FakeJobCall::Fetch(strategy));
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        match self.rows.read().unwrap().get(&strategy) {
            Some(Ok(rows)) => Ok(rows.clone()),
            Some(Err(message)) => Err(ServiceError::Other(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// ScriptedExtractor
// ============================================================================

#[derive(Debug, Clone)]
struct FailureScript {
    /// `None` fails forever
    remaining: Option<usize>,
    kind: ErrorKind,
    message: String,
}

/// An [`Extractor`] whose failures are scripted per input key.
///
/// Succeeds with `{"key": .., "attempt": ..}` unless a failure is scripted.
/// Tracks concurrent invocations so tests can assert concurrency bounds.
#[derive(Default)]
pub struct ScriptedExtractor {
    failures: RwLock<HashMap<String, FailureScript>>,

    /// Each extraction consumes one permit before finishing
    gate: Option<Arc<Semaphore>>,

    delay: Option<Duration>,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    /// Keys in invocation order
    calls: RwLock<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every attempt for `key` with a retryable error.
    pub fn failing_always(self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(key, None, ErrorKind::Retryable, message)
    }

    /// Fail the first `times` attempts for `key`, then succeed.
    pub fn failing_times(self, key: impl Into<String>, times: usize, message: impl Into<String>) -> Self {
        self.script(key, Some(times), ErrorKind::Retryable, message)
    }

    /// Fail every attempt for `key` with a non-retryable error.
    pub fn failing_permanently(self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(key, None, ErrorKind::NonRetryable, message)
    }

    /// Block every extraction until a permit is available on `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn script(
        self,
        key: impl Into<String>,
        remaining: Option<usize>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        self.failures.write().unwrap().insert(
            key.into(),
            FailureScript {
                remaining,
                kind,
                message: message.into(),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.read().unwrap().iter().filter(|k| *k == key).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous extractions observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, key: &str) -> Option<ExtractionError> {
        let mut failures = self.failures.write().unwrap();
        let script = failures.get_mut(key)?;
        match &mut script.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(ExtractionError {
            kind: script.kind,
            message: script.message.clone(),
        })
    }
}

/// Decrements the in-flight counter even when the extraction is cancelled.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, input: &WorkInput) -> Result<Value, ExtractionError> {
        let attempt = {
            let mut calls = self.calls.write().unwrap();
            calls.push(input.key.clone());
            calls.iter().filter(|k| **k == input.key).count()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ExtractionError::retryable(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.scripted_failure(&input.key) {
            Some(err) => Err(err),
            None => Ok(json!({ "key": input.key, "attempt": attempt })),
        }
    }
}

// ============================================================================
// RecordingObserver
// ============================================================================

/// A [`ProgressObserver`] that remembers every call.
#[derive(Default)]
pub struct RecordingObserver {
    progress: RwLock<Vec<f64>>,
    statuses: RwLock<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_updates(&self) -> Vec<f64> {
        self.progress.read().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.read().unwrap().clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn progress(&self, fraction: f64) {
        self.progress.write().unwrap().push(fraction);
    }

    fn status(&self, message: &str) {
        self.statuses.write().unwrap().push(message.to_string());
    }
}
