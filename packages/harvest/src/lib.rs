//! Resilient orchestration for remote scraping jobs and bulk extraction.
//!
//! Two problems recur across every scraping workflow:
//!
//! - driving an external "submit, poll, fetch" job to a result even though
//!   its status and result endpoints are unreliable
//! - working through thousands of per-record extractions with bounded
//!   concurrency, retries and restarts, without ever redoing finished work
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use harvest::{enqueue_and_drain, EngineConfig, SqliteStore, TracingObserver, WorkInput};
//! use harvest::extractors::ContactExtractor;
//!
//! let store = Arc::new(SqliteStore::connect("sqlite://harvest.db?mode=rwc").await?);
//! let extractor = Arc::new(ContactExtractor::from_config(&config.providers)?);
//! let inputs: Vec<WorkInput> = urls.iter().map(WorkInput::url).collect();
//!
//! let summary = enqueue_and_drain(
//!     store,
//!     &inputs,
//!     extractor,
//!     &EngineConfig::default(),
//!     &TracingObserver,
//! )
//! .await?;
//! println!("{} of {} succeeded", summary.succeeded, summary.total);
//! ```
//!
//! # Modules
//!
//! - [`store`] - Durable work item bookkeeping (MemoryStore, SqliteStore)
//! - [`engine`] - Bounded-concurrency drain with retry and backoff
//! - [`remote`] - Remote job client with ordered fetch fallback
//! - [`ranker`] - Query relevance scoring
//! - [`extractors`] - Contact and remote-job extractors
//! - [`testing`] - Fakes for tests

pub mod config;
pub mod engine;
pub mod error;
pub mod extractors;
pub mod observer;
pub mod ranker;
pub mod remote;
pub mod store;
pub mod testing;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use config::{EngineConfig, HarvestConfig, PollConfig, ProviderConfig};
pub use engine::{DrainSummary, ExtractionEngine, Extractor, FnExtractor};
pub use error::{Error, ExtractionError, JobError, Result, ServiceError, StoreError};
pub use observer::{FnObserver, NoopObserver, ProgressObserver, TracingObserver};
pub use ranker::{rank, Document, RankingWeights, RelevanceRanker, ScoredRecord};
pub use remote::{
    ApifyJobService, FetchStrategy, JobService, JobSpec, JobState, RemoteJob, RemoteJobClient, Row,
};
pub use store::{MemoryStore, SqliteStore, WorkStore};
pub use types::{ErrorKind, RetryPolicy, StoreStats, WorkInput, WorkItem, WorkStatus};

/// Enqueue `inputs` and drain the whole backlog.
///
/// Never fails because of individual items: per-item failure reasons stay
/// in the store and the summary reports how many succeeded and failed.
pub async fn enqueue_and_drain<S: WorkStore + ?Sized>(
    store: Arc<S>,
    inputs: &[WorkInput],
    extractor: Arc<dyn Extractor>,
    config: &EngineConfig,
    observer: &dyn ProgressObserver,
) -> Result<DrainSummary> {
    let inserted = store.enqueue(inputs).await?;
    info!(submitted = inputs.len(), inserted, "backlog enqueued");

    let engine = ExtractionEngine::new(store, config.clone());
    Ok(engine.drain(extractor, observer).await?)
}

/// Run a single remote job outside any backlog.
pub async fn run_remote_job<S: JobService + ?Sized>(
    service: Arc<S>,
    spec: &JobSpec,
    max_wait: Duration,
    config: &PollConfig,
) -> std::result::Result<Vec<Row>, JobError> {
    RemoteJobClient::new(service, config.clone())
        .run(spec, max_wait)
        .await
}
