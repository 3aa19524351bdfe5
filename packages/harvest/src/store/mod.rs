//! Durable bookkeeping of work items.
//!
//! The store is the only state shared between workers. Every mutation is a
//! single-item atomic transition, so concurrent workers (and concurrent engine
//! instances) need no broader lock:
//!
//! ```text
//! enqueue ──► Pending ──claim_pending──► InProgress ──complete──► Success
//!               ▲                           │
//!               │      fail (retryable,     ├──fail (exhausted)──► Failed
//!               └──── attempts remain) ─────┘                        │
//!               ▲                                                    │
//!               └───────────────── requeue_failed ───────────────────┘
//! ```
//!
//! `InProgress` items orphaned by a crash are returned to `Pending` by
//! [`WorkStore::reclaim_stale`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::types::{ErrorKind, FailOutcome, RetryPolicy, StoreStats, WorkInput, WorkItem, WorkStatus};

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert inputs as `Pending`, skipping any whose key is already stored.
    ///
    /// Returns how many were actually new. Safe to call repeatedly with
    /// overlapping batches.
    async fn enqueue(&self, inputs: &[WorkInput]) -> StoreResult<usize>;

    /// Atomically move up to `limit` claimable `Pending` items to `InProgress`.
    ///
    /// Oldest items first; items still inside their backoff window are skipped.
    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<WorkItem>>;

    /// Record a successful extraction for a claimed item.
    async fn complete(&self, id: Uuid, result: &serde_json::Value) -> StoreResult<()>;

    /// Record a failed attempt for a claimed item.
    ///
    /// Increments `attempt_count`. The item returns to `Pending` behind a
    /// backoff gate if `kind` is retryable and `policy` allows another
    /// attempt; otherwise it becomes `Failed` with `reason`.
    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
    ) -> StoreResult<FailOutcome>;

    /// Return `InProgress` items claimed more than `max_age` ago to `Pending`.
    async fn reclaim_stale(&self, max_age: Duration) -> StoreResult<usize>;

    /// Earliest instant at which some `Pending` item becomes claimable.
    ///
    /// `None` when nothing is pending.
    async fn next_available_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<WorkItem>>;

    /// All items, or only those with `status`, oldest first.
    async fn list(&self, status: Option<WorkStatus>) -> StoreResult<Vec<WorkItem>>;

    /// Explicitly send every `Failed` item back to `Pending` with a fresh attempt budget.
    async fn requeue_failed(&self) -> StoreResult<usize>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

/// Convert a `std` duration to a `chrono` one, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
