//! Work item model shared by the store and the engine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of a work item.
///
/// `Pending → InProgress → {Success | Failed}`. A retryable failure moves an
/// item from `InProgress` back to `Pending`; nothing else returns an item to
/// `Pending` except an explicit requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Success => "success",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Success | WorkStatus::Failed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "in_progress" => Ok(WorkStatus::InProgress),
            "success" => Ok(WorkStatus::Success),
            "failed" => Ok(WorkStatus::Failed),
            other => Err(format!("unknown work status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

// ============================================================================
// Work items
// ============================================================================

/// The payload needed to perform one unit of work.
///
/// `key` is the dedup identity (usually the URL string); `payload` is opaque
/// to the core and handed to the extractor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkInput {
    pub key: String,
    pub payload: serde_json::Value,
}

impl WorkInput {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// A URL input, deduplicated on the trimmed URL string.
    pub fn url(url: impl AsRef<str>) -> Self {
        let url = url.as_ref().trim();
        Self {
            key: url.to_string(),
            payload: serde_json::json!({ "url": url }),
        }
    }

    /// The URL carried by the payload, if any.
    pub fn as_url(&self) -> Option<&str> {
        self.payload.get("url").and_then(|v| v.as_str())
    }
}

impl From<&str> for WorkInput {
    fn from(url: &str) -> Self {
        WorkInput::url(url)
    }
}

impl From<String> for WorkInput {
    fn from(url: String) -> Self {
        WorkInput::url(url)
    }
}

/// One unit of backlog work with its persisted status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub input: WorkInput,
    pub status: WorkStatus,
    /// Extractor output once `Success`
    pub result: Option<serde_json::Value>,
    /// Most recent failure reason; the final one once `Failed`
    pub error: Option<String>,
    pub attempt_count: u32,
    /// Backoff gate: not claimable before this instant
    pub available_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A fresh `Pending` item for `input`.
    pub fn new(input: WorkInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            input,
            status: WorkStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            available_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the item can be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Pending && self.available_at.map_or(true, |at| at <= now)
    }
}

/// Counts of work items by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StoreStats {
    pub(crate) fn record(&mut self, status: WorkStatus, count: usize) {
        self.total += count;
        match status {
            WorkStatus::Pending => self.pending += count,
            WorkStatus::InProgress => self.in_progress += count,
            WorkStatus::Success => self.succeeded += count,
            WorkStatus::Failed => self.failed += count,
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// How many attempts an item gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }

    /// Delay before the item may be claimed again after `attempt_count` attempts.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt_count)
    }

    /// Whether an item that has made `attempt_count` attempts may try again.
    pub fn allows_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts.max(1)
    }
}

/// What `fail` did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `Pending`, claimable from `available_at`
    Retrying {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Recorded as `Failed`
    Exhausted { attempt: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            WorkStatus::Pending,
            WorkStatus::InProgress,
            WorkStatus::Success,
            WorkStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!("done".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn test_url_input_trims_key() {
        let input = WorkInput::url("  https://example.com/contact \n");
        assert_eq!(input.key, "https://example.com/contact");
        assert_eq!(input.as_url(), Some("https://example.com/contact"));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_zero_max_attempts_still_allows_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert!(!policy.allows_retry(1));
        assert!(policy.allows_retry(0));
    }

    #[test]
    fn test_backoff_gate_blocks_claim() {
        let mut item = WorkItem::new(WorkInput::url("https://a.example"));
        let now = Utc::now();
        assert!(item.is_claimable(now));

        item.available_at = Some(now + chrono::Duration::seconds(5));
        assert!(!item.is_claimable(now));
        assert!(item.is_claimable(now + chrono::Duration::seconds(6)));
    }
}
