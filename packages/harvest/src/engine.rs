//! Bounded-concurrency drain of a work backlog.
//!
//! # Architecture
//!
//! ```text
//! ExtractionEngine::drain
//!     │
//!     ├─► reclaim_stale (crash recovery)
//!     ├─► claim_pending(free slots) ──► JoinSet worker per item
//!     │                                     └─► Extractor::extract(input)
//!     ├─► join_next ──► complete / fail (retry gate) ──► observer
//!     └─► all slots idle and items gated? sleep until next_available_at
//! ```
//!
//! Workers never touch the store; the coordinator settles every attempt,
//! so a slow or hung extraction only ever occupies its own slot.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ExtractionError, StoreResult};
use crate::observer::ProgressObserver;
use crate::store::WorkStore;
use crate::types::{FailOutcome, RetryPolicy, WorkInput, WorkItem};

/// Lower bound on coordinator sleeps while waiting for a backoff gate.
const MIN_WAKE_INTERVAL: Duration = Duration::from_millis(25);

/// Performs the work for one item.
///
/// Implementations must not rely on process-wide mutable state; many
/// extractions run concurrently.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, input: &WorkInput) -> Result<Value, ExtractionError>;
}

/// [`Extractor`] from an async closure.
pub struct FnExtractor<F> {
    f: F,
}

impl<F> FnExtractor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Extractor for FnExtractor<F>
where
    F: Fn(WorkInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExtractionError>> + Send,
{
    async fn extract(&self, input: &WorkInput) -> Result<Value, ExtractionError> {
        (self.f)(input.clone()).await
    }
}

/// Outcome counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    /// Pending items when the drain started
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed attempts that were scheduled for another try
    pub retried: usize,
    /// Extractor invocations
    pub attempts: usize,
}

impl DrainSummary {
    /// Items that reached a terminal state during the drain.
    pub fn settled(&self) -> usize {
        self.succeeded + self.failed
    }

    fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.settled() as f64 / self.total as f64).min(1.0)
    }
}

/// Drains a [`WorkStore`] backlog through an [`Extractor`].
pub struct ExtractionEngine<S: WorkStore + ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: WorkStore + ?Sized> ExtractionEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process every `Pending` item until none remain.
    ///
    /// Extraction failures never abort the drain; they become store state.
    /// Only store failures while claiming are returned as errors.
    pub async fn drain(
        &self,
        extractor: Arc<dyn Extractor>,
        observer: &dyn ProgressObserver,
    ) -> StoreResult<DrainSummary> {
        let concurrency = self.config.concurrency.max(1);
        let policy = self.config.retry_policy();

        let reclaimed = self.store.reclaim_stale(self.config.stale_after).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "returned stale in-progress items to pending");
        }

        let mut summary = DrainSummary {
            total: self.store.stats().await?.pending,
            ..Default::default()
        };
        info!(total = summary.total, concurrency, "drain started");

        let mut in_flight: JoinSet<(WorkItem, Result<Value, ExtractionError>)> = JoinSet::new();

        loop {
            let free = concurrency.saturating_sub(in_flight.len());
            if free > 0 {
                for item in self.store.claim_pending(free).await? {
                    debug!(item_id = %item.id, key = %item.input.key, attempt = item.attempt_count + 1, "dispatching");
                    let extractor = Arc::clone(&extractor);
                    let item_timeout = self.config.item_timeout;
                    in_flight.spawn(async move {
                        let outcome = run_attempt(extractor.as_ref(), &item.input, item_timeout).await;
                        (item, outcome)
                    });
                }
            }

            if in_flight.is_empty() {
                match self.store.next_available_at().await? {
                    None => break,
                    Some(at) => {
                        tokio::time::sleep(wait_until(at)).await;
                        continue;
                    }
                }
            }

            // With idle slots, also wake when a backoff gate opens
            let wake = if in_flight.len() < concurrency {
                self.store.next_available_at().await?
            } else {
                None
            };

            tokio::select! {
                Some(joined) = in_flight.join_next() => match joined {
                    Ok((item, outcome)) => {
                        let message = self.settle(&item, outcome, &policy, &mut summary).await;
                        observer.progress(summary.fraction());
                        observer.status(&message);
                    }
                    Err(e) => {
                        // Item stays in progress until reclaimed as stale
                        error!(error = %e, "extraction task did not finish");
                    }
                },
                _ = tokio::time::sleep(wake.map(wait_until).unwrap_or_default()), if wake.is_some() => {}
            }
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            retried = summary.retried,
            attempts = summary.attempts,
            "drain finished"
        );
        Ok(summary)
    }

    /// Write one attempt's outcome back to the store and describe it.
    async fn settle(
        &self,
        item: &WorkItem,
        outcome: Result<Value, ExtractionError>,
        policy: &RetryPolicy,
        summary: &mut DrainSummary,
    ) -> String {
        summary.attempts += 1;
        let key = &item.input.key;

        match outcome {
            Ok(value) => match self.store.complete(item.id, &value).await {
                Ok(()) => {
                    summary.succeeded += 1;
                    info!(item_id = %item.id, %key, "extraction succeeded");
                    format!("[{}/{}] done: {}", summary.settled(), summary.total, key)
                }
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "failed to record success");
                    format!("could not record result for {}: {}", key, e)
                }
            },
            Err(err) => match self
                .store
                .fail(item.id, &err.message, err.kind, policy)
                .await
            {
                Ok(FailOutcome::Retrying {
                    attempt,
                    available_at,
                }) => {
                    summary.retried += 1;
                    warn!(
                        item_id = %item.id,
                        %key,
                        attempt,
                        max_attempts = policy.max_attempts,
                        retry_at = %available_at,
                        error = %err,
                        "extraction failed, will retry"
                    );
                    format!(
                        "retrying {} (attempt {}/{}): {}",
                        key, attempt, policy.max_attempts, err
                    )
                }
                Ok(FailOutcome::Exhausted { attempt }) => {
                    summary.failed += 1;
                    error!(item_id = %item.id, %key, attempt, error = %err, "extraction failed permanently");
                    format!("[{}/{}] failed: {}: {}", summary.settled(), summary.total, key, err)
                }
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "failed to record failure");
                    format!("could not record failure for {}: {}", key, e)
                }
            },
        }
    }
}

/// Run one extraction, converting panics and timeouts into retryable errors.
async fn run_attempt(
    extractor: &dyn Extractor,
    input: &WorkInput,
    item_timeout: Option<Duration>,
) -> Result<Value, ExtractionError> {
    let attempt = AssertUnwindSafe(extractor.extract(input)).catch_unwind();

    let caught = match item_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(caught) => caught,
            Err(_) => {
                return Err(ExtractionError::retryable(format!(
                    "extraction timed out after {:?}",
                    limit
                )))
            }
        },
        None => attempt.await,
    };

    caught.unwrap_or_else(|panic| {
        Err(ExtractionError::retryable(format!(
            "extractor panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn wait_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_WAKE_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedExtractor;
    use crate::types::WorkStatus;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn engine(config: EngineConfig) -> ExtractionEngine<MemoryStore> {
        ExtractionEngine::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_empty_backlog_finishes_immediately() {
        let engine = engine(EngineConfig::default());
        let extractor = Arc::new(FnExtractor::new(|_input: WorkInput| async {
            Ok::<_, ExtractionError>(json!({}))
        }));

        let summary = engine.drain(extractor, &NoopObserver).await.unwrap();
        assert_eq!(summary, DrainSummary::default());
    }

    #[tokio::test]
    async fn test_panicking_extractor_is_recorded_as_failure() {
        let engine = engine(EngineConfig::default().with_max_attempts(1));
        engine
            .store()
            .enqueue(&[WorkInput::url("https://boom.example"), WorkInput::url("https://ok.example")])
            .await
            .unwrap();

        let extractor = Arc::new(FnExtractor::new(|input: WorkInput| async move {
            if input.key.contains("boom") {
                panic!("parser exploded");
            }
            Ok::<_, ExtractionError>(json!({"key": input.key}))
        }));

        let summary = engine.drain(extractor, &NoopObserver).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let failed = engine.store().list(Some(WorkStatus::Failed)).await.unwrap();
        assert!(failed[0].error.as_deref().unwrap().contains("parser exploded"));
    }

    #[tokio::test]
    async fn test_item_timeout_turns_hang_into_retryable_failure() {
        let config = EngineConfig::default()
            .with_max_attempts(2)
            .with_backoff_base(Duration::from_millis(10))
            .with_item_timeout(Duration::from_millis(50));
        let engine = engine(config);
        engine
            .store()
            .enqueue(&[WorkInput::url("https://slow.example")])
            .await
            .unwrap();

        let extractor = Arc::new(FnExtractor::new(|_input: WorkInput| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, ExtractionError>(json!({}))
        }));

        let summary = engine.drain(extractor, &NoopObserver).await.unwrap();
        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failed, 1);

        let item = &engine.store().list(None).await.unwrap()[0];
        assert!(item.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retries_wait_out_their_backoff() {
        let base = Duration::from_millis(40);
        let engine = engine(
            EngineConfig::default()
                .with_max_attempts(3)
                .with_backoff_base(base),
        );
        engine
            .store()
            .enqueue(&[WorkInput::url("https://flaky.example")])
            .await
            .unwrap();

        let dispatched = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&dispatched);
        let extractor = Arc::new(FnExtractor::new(move |_input: WorkInput| {
            record.lock().unwrap().push(std::time::Instant::now());
            async { Err::<Value, _>(ExtractionError::retryable("HTTP 503")) }
        }));

        let summary = engine.drain(extractor, &NoopObserver).await.unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.failed, 1);

        let dispatched = dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 3);
        // Retry n is gated by n * base; allow a millisecond of clock skew
        let slack = Duration::from_millis(1);
        for n in 1..dispatched.len() {
            let gap = dispatched[n] - dispatched[n - 1];
            let gate = base * n as u32;
            assert!(gap + slack >= gate, "retry {n} after {gap:?}, gate {gate:?}");
        }
    }

    #[tokio::test]
    async fn test_blocked_extractions_never_exceed_concurrency() {
        let gate = Arc::new(Semaphore::new(0));
        let extractor = Arc::new(ScriptedExtractor::new().with_gate(Arc::clone(&gate)));
        let engine = engine(EngineConfig::default().with_concurrency(2));
        let inputs: Vec<_> = (0..5)
            .map(|i| WorkInput::url(format!("https://site{}.example", i)))
            .collect();
        engine.store().enqueue(&inputs).await.unwrap();

        // Release one extraction at a time
        let release = async {
            for _ in 0..inputs.len() {
                while extractor.in_flight() == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(extractor.in_flight() <= 2);
                gate.add_permits(1);
            }
        };

        let (summary, ()) = tokio::join!(engine.drain(extractor.clone(), &NoopObserver), release);
        assert_eq!(summary.unwrap().succeeded, 5);
        assert_eq!(extractor.max_in_flight(), 2);
    }

    #[test]
    fn test_summary_fraction_is_clamped() {
        let summary = DrainSummary {
            total: 2,
            succeeded: 3,
            ..Default::default()
        };
        assert_eq!(summary.fraction(), 1.0);
        assert_eq!(DrainSummary::default().fraction(), 1.0);
    }
}
