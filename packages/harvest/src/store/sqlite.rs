//! SQLite storage implementation.
//!
//! Every transition is a single conditional `UPDATE`, so several engine
//! processes can share one database file. Timestamps are stored as epoch
//! milliseconds so the backoff gate compares as integers.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{chrono_duration, WorkStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    ErrorKind, FailOutcome, RetryPolicy, StoreStats, WorkInput, WorkItem, WorkStatus,
};

/// Upper bound for the per-attempt backoff step, keeps the SQL arithmetic in range.
const MAX_BACKOFF_STEP_MS: i64 = i32::MAX as i64;

const WORK_ITEM_COLUMNS: &str = "rowid AS seq, id, input_key, payload, status, result, error, \
     attempt_count, available_at, claimed_at, created_at, updated_at";

/// SQLite-backed work store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// # Example URLs
    /// - `sqlite://harvest.db?mode=rwc` - file database, created if missing
    /// - `sqlite::memory:` - prefer [`SqliteStore::in_memory`]
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Ephemeral database for tests.
    ///
    /// Uses a single connection; each `:memory:` connection would otherwise
    /// see its own empty database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id TEXT PRIMARY KEY,
                input_key TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_work_items_claimable ON work_items(status, available_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn status_of(&self, id: Uuid) -> StoreResult<Option<WorkStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM work_items WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        status.map(|s| parse_status(&s)).transpose()
    }

    /// Explain why a conditional update touched no rows.
    async fn transition_error(&self, id: Uuid, action: &'static str) -> StoreError {
        match self.status_of(id).await {
            Ok(Some(status)) => StoreError::InvalidTransition { id, status, action },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct WorkItemRow {
    #[allow(dead_code)]
    seq: i64,
    id: String,
    input_key: String,
    payload: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempt_count: i64,
    available_at: Option<i64>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl WorkItemRow {
    fn into_work_item(self) -> StoreResult<WorkItem> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("invalid id {}: {}", self.id, e)))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(WorkItem {
            id,
            input: WorkInput {
                key: self.input_key,
                payload: serde_json::from_str(&self.payload)?,
            },
            status: parse_status(&self.status)?,
            result,
            error: self.error,
            attempt_count: u32::try_from(self.attempt_count)
                .map_err(|_| StoreError::Corrupt(format!("attempt_count {}", self.attempt_count)))?,
            available_at: self.available_at.map(from_millis).transpose()?,
            claimed_at: self.claimed_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn parse_status(raw: &str) -> StoreResult<WorkStatus> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkStore for SqliteStore {
    async fn enqueue(&self, inputs: &[WorkInput]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for input in inputs {
            let item = WorkItem::new(input.clone());
            let now = to_millis(item.created_at);

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO work_items
                    (id, input_key, payload, status, attempt_count, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', 0, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(&item.input.key)
            .bind(serde_json::to_string(&item.input.payload)?)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        debug!(submitted = inputs.len(), inserted, "enqueued work items");
        Ok(inserted)
    }

    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<WorkItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = to_millis(Utc::now());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            UPDATE work_items
            SET status = 'in_progress', claimed_at = ?1, updated_at = ?1
            WHERE id IN (
                SELECT id FROM work_items
                WHERE status = 'pending'
                  AND (available_at IS NULL OR available_at <= ?1)
                ORDER BY rowid
                LIMIT ?2
            )
            RETURNING {}
            "#,
            WORK_ITEM_COLUMNS
        );

        let mut rows = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    async fn complete(&self, id: Uuid, result: &serde_json::Value) -> StoreResult<()> {
        let now = to_millis(Utc::now());
        let updated = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'success', result = ?, error = NULL, claimed_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, "complete").await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
    ) -> StoreResult<FailOutcome> {
        let now = to_millis(Utc::now());
        let step_ms = duration_millis(policy.backoff_base).min(MAX_BACKOFF_STEP_MS);
        let max_attempts = i64::from(policy.max_attempts.max(1));

        // SET expressions see the pre-update row
        let row: Option<(String, i64, Option<i64>)> = sqlx::query_as(
            r#"
            UPDATE work_items
            SET attempt_count = attempt_count + 1,
                error = ?1,
                claimed_at = NULL,
                updated_at = ?2,
                status = CASE
                    WHEN ?3 AND attempt_count + 1 < ?4 THEN 'pending'
                    ELSE 'failed'
                END,
                available_at = CASE
                    WHEN ?3 AND attempt_count + 1 < ?4 THEN ?2 + ?5 * (attempt_count + 1)
                    ELSE NULL
                END
            WHERE id = ?6 AND status = 'in_progress'
            RETURNING status, attempt_count, available_at
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(kind.should_retry())
        .bind(max_attempts)
        .bind(step_ms)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, attempt, available_at)) = row else {
            return Err(self.transition_error(id, "fail").await);
        };
        let attempt = u32::try_from(attempt)
            .map_err(|_| StoreError::Corrupt(format!("attempt_count {}", attempt)))?;

        match (parse_status(&status)?, available_at) {
            (WorkStatus::Pending, Some(ms)) => Ok(FailOutcome::Retrying {
                attempt,
                available_at: from_millis(ms)?,
            }),
            (WorkStatus::Failed, _) => Ok(FailOutcome::Exhausted { attempt }),
            (other, _) => Err(StoreError::Corrupt(format!(
                "unexpected status {} after fail",
                other
            ))),
        }
    }

    async fn reclaim_stale(&self, max_age: Duration) -> StoreResult<usize> {
        let now = Utc::now();
        let Some(cutoff) = now.checked_sub_signed(chrono_duration(max_age)) else {
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'pending', claimed_at = NULL, updated_at = ?
            WHERE status = 'in_progress'
              AND (claimed_at IS NULL OR claimed_at < ?)
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn next_available_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let now = to_millis(Utc::now());
        let earliest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(COALESCE(available_at, ?)) FROM work_items WHERE status = 'pending'",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        earliest.map(from_millis).transpose()
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<WorkItem>> {
        let sql = format!("SELECT {} FROM work_items WHERE id = ?", WORK_ITEM_COLUMNS);
        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(WorkItemRow::into_work_item).transpose()
    }

    async fn list(&self, status: Option<WorkStatus>) -> StoreResult<Vec<WorkItem>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM work_items WHERE status = ? ORDER BY rowid",
                    WORK_ITEM_COLUMNS
                );
                sqlx::query_as::<_, WorkItemRow>(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {} FROM work_items ORDER BY rowid", WORK_ITEM_COLUMNS);
                sqlx::query_as::<_, WorkItemRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    async fn requeue_failed(&self) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'pending', attempt_count = 0, available_at = NULL, updated_at = ?
            WHERE status = 'failed'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM work_items GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = StoreStats::default();
        for (status, count) in counts {
            stats.record(parse_status(&status)?, count.max(0) as usize);
        }
        Ok(stats)
    }
}
