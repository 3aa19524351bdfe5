//! In-memory work store for testing and development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{chrono_duration, WorkStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    ErrorKind, FailOutcome, RetryPolicy, StoreStats, WorkInput, WorkItem, WorkStatus,
};

/// In-memory storage for work items.
///
/// Same semantics as [`SqliteStore`](super::SqliteStore) but data is lost on
/// restart. A single mutex makes every transition atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as claim order
    items: Vec<WorkItem>,
    by_id: HashMap<Uuid, usize>,
    by_key: HashMap<String, usize>,
}

impl Inner {
    fn item_mut(&mut self, id: Uuid) -> StoreResult<&mut WorkItem> {
        let index = *self.by_id.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(&mut self.items[index])
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pretend an item was claimed at `at` (crash simulations in tests).
    pub fn backdate_claim(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let item = inner.item_mut(id)?;
        item.claimed_at = Some(at);
        Ok(())
    }
}

fn ensure_in_progress(item: &WorkItem, action: &'static str) -> StoreResult<()> {
    if item.status == WorkStatus::InProgress {
        return Ok(());
    }
    Err(StoreError::InvalidTransition {
        id: item.id,
        status: item.status,
        action,
    })
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn enqueue(&self, inputs: &[WorkInput]) -> StoreResult<usize> {
        let mut inner = self.lock();
        let mut inserted = 0;

        for input in inputs {
            if inner.by_key.contains_key(&input.key) {
                continue;
            }
            let item = WorkItem::new(input.clone());
            let index = inner.items.len();
            inner.by_id.insert(item.id, index);
            inner.by_key.insert(item.input.key.clone(), index);
            inner.items.push(item);
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<WorkItem>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();

        for item in inner.items.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !item.is_claimable(now) {
                continue;
            }
            item.status = WorkStatus::InProgress;
            item.claimed_at = Some(now);
            item.updated_at = now;
            claimed.push(item.clone());
        }

        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, result: &serde_json::Value) -> StoreResult<()> {
        let mut inner = self.lock();
        let item = inner.item_mut(id)?;
        ensure_in_progress(item, "complete")?;

        item.status = WorkStatus::Success;
        item.result = Some(result.clone());
        item.error = None;
        item.claimed_at = None;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
    ) -> StoreResult<FailOutcome> {
        let mut inner = self.lock();
        let item = inner.item_mut(id)?;
        ensure_in_progress(item, "fail")?;

        let now = Utc::now();
        let attempt = item.attempt_count + 1;
        item.attempt_count = attempt;
        item.error = Some(reason.to_string());
        item.claimed_at = None;
        item.updated_at = now;

        if kind.should_retry() && policy.allows_retry(attempt) {
            let available_at = now
                .checked_add_signed(chrono_duration(policy.backoff_for(attempt)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            item.status = WorkStatus::Pending;
            item.available_at = Some(available_at);
            Ok(FailOutcome::Retrying {
                attempt,
                available_at,
            })
        } else {
            item.status = WorkStatus::Failed;
            item.available_at = None;
            Ok(FailOutcome::Exhausted { attempt })
        }
    }

    async fn reclaim_stale(&self, max_age: Duration) -> StoreResult<usize> {
        let mut inner = self.lock();
        let now = Utc::now();
        let Some(cutoff) = now.checked_sub_signed(chrono_duration(max_age)) else {
            return Ok(0);
        };
        let mut reclaimed = 0;

        for item in inner.items.iter_mut() {
            let stale = item.status == WorkStatus::InProgress
                && item.claimed_at.map_or(true, |at| at < cutoff);
            if stale {
                item.status = WorkStatus::Pending;
                item.claimed_at = None;
                item.updated_at = now;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    async fn next_available_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.lock();
        let now = Utc::now();
        Ok(inner
            .items
            .iter()
            .filter(|item| item.status == WorkStatus::Pending)
            .map(|item| item.available_at.unwrap_or(now))
            .min())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<WorkItem>> {
        let inner = self.lock();
        Ok(inner.by_id.get(&id).map(|&index| inner.items[index].clone()))
    }

    async fn list(&self, status: Option<WorkStatus>) -> StoreResult<Vec<WorkItem>> {
        let inner = self.lock();
        Ok(inner
            .items
            .iter()
            .filter(|item| status.map_or(true, |s| item.status == s))
            .cloned()
            .collect())
    }

    async fn requeue_failed(&self) -> StoreResult<usize> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut requeued = 0;

        for item in inner.items.iter_mut().filter(|i| i.status == WorkStatus::Failed) {
            item.status = WorkStatus::Pending;
            item.attempt_count = 0;
            item.available_at = None;
            item.updated_at = now;
            requeued += 1;
        }

        Ok(requeued)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.lock();
        let mut stats = StoreStats::default();
        for item in &inner.items {
            stats.record(item.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn urls(list: &[&str]) -> Vec<WorkInput> {
        list.iter().map(|u| WorkInput::url(*u)).collect()
    }

    #[tokio::test]
    async fn test_enqueue_dedups_within_batch() {
        let store = MemoryStore::new();
        let inserted = store
            .enqueue(&urls(&["https://a.example", "https://a.example", "https://b.example"]))
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let store = MemoryStore::new();
        store
            .enqueue(&urls(&["https://1.example", "https://2.example", "https://3.example"]))
            .await
            .unwrap();

        let claimed = store.claim_pending(2).await.unwrap();
        let keys: Vec<_> = claimed.iter().map(|i| i.input.key.as_str()).collect();
        assert_eq!(keys, vec!["https://1.example", "https://2.example"]);
        assert!(claimed.iter().all(|i| i.status == WorkStatus::InProgress));

        let rest = store.claim_pending(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_requires_claim() {
        let store = MemoryStore::new();
        store.enqueue(&urls(&["https://a.example"])).await.unwrap();
        let id = store.list(None).await.unwrap()[0].id;

        let err = store.complete(id, &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                status: WorkStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fail_applies_backoff_gate() {
        let store = MemoryStore::new();
        store.enqueue(&urls(&["https://a.example"])).await.unwrap();
        let item = store.claim_pending(1).await.unwrap().remove(0);

        let policy = RetryPolicy::new(3, Duration::from_secs(60));
        let outcome = store
            .fail(item.id, "boom", ErrorKind::Retryable, &policy)
            .await
            .unwrap();

        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));
        assert!(store.claim_pending(1).await.unwrap().is_empty());
        assert!(store.next_available_at().await.unwrap().unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let store = MemoryStore::new();
        store.enqueue(&urls(&["https://a.example"])).await.unwrap();
        let item = store.claim_pending(1).await.unwrap().remove(0);

        let outcome = store
            .fail(item.id, "404", ErrorKind::NonRetryable, &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(outcome, FailOutcome::Exhausted { attempt: 1 });
        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("404"));
    }

    #[tokio::test]
    async fn test_reclaim_stale_only_touches_old_claims() {
        let store = MemoryStore::new();
        store
            .enqueue(&urls(&["https://old.example", "https://fresh.example"]))
            .await
            .unwrap();
        let claimed = store.claim_pending(2).await.unwrap();
        store
            .backdate_claim(claimed[0].id, Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        let reclaimed = store.reclaim_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(reclaimed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 1);
    }
}
