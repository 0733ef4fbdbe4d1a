//! PostgreSQL backend.
//!
//! Records live in the `deferred_jobs` table created by
//! `migrations/0001_create_deferred_jobs.sql`. The claim is a single
//! conditional `UPDATE ... RETURNING` that re-applies the candidate filter;
//! an empty result means the race was lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{Backend, BackendInfo, QueueStats, ReserveCriteria};
use crate::config::DatabaseConfig;
use crate::error::{DeferredError, ErrorCode, Result};
use crate::jobs::{JobId, JobRecord};

/// Table holding job records.
pub const TABLE: &str = "deferred_jobs";

const COLUMNS: &str = "id, priority, attempts, queue, handler, payload, run_at, locked_at, \
    locked_by, failed_at, last_error, max_attempts, max_run_time_ms, created_at, updated_at";

/// Job storage backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    database: String,
}

impl PostgresBackend {
    /// Create a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let database: String = sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&pool)
            .await?;

        info!(database = %database, table = TABLE, "Connected to job database");
        Ok(Self { pool, database })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl Backend for PostgresBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            adapter: "postgres".to_string(),
            database: self.database.clone(),
            table: TABLE.to_string(),
        }
    }

    async fn insert(&self, record: &JobRecord) -> Result<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO deferred_jobs (priority, attempts, queue, handler, payload, run_at,
                                       locked_at, locked_by, failed_at, last_error,
                                       max_attempts, max_run_time_ms, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(record.priority)
        .bind(to_i32(record.attempts))
        .bind(&record.queue)
        .bind(&record.handler)
        .bind(&record.payload)
        .bind(record.run_at)
        .bind(record.locked_at)
        .bind(&record.locked_by)
        .bind(record.failed_at)
        .bind(&record.last_error)
        .bind(record.max_attempts.map(to_i32))
        .bind(record.max_run_time.map(millis))
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn candidates(&self, criteria: &ReserveCriteria) -> Result<Vec<JobRecord>> {
        let limit = i64::try_from(criteria.read_ahead).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM deferred_jobs
            WHERE failed_at IS NULL
              AND run_at <= $1
              AND (locked_at IS NULL
                   OR locked_at < $1 - make_interval(
                        secs => COALESCE(max_run_time_ms, $2)::double precision / 1000.0))
              AND (cardinality($3::text[]) = 0 OR queue = ANY($3))
              AND ($4::integer IS NULL OR priority >= $4)
              AND ($5::integer IS NULL OR priority <= $5)
            ORDER BY priority, run_at, id
            LIMIT $6
            "#
        ))
        .bind(criteria.now)
        .bind(millis(criteria.max_run_time))
        .bind(&criteria.queues)
        .bind(criteria.min_priority)
        .bind(criteria.max_priority)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    async fn claim(&self, candidate: &JobRecord, criteria: &ReserveCriteria) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE deferred_jobs
            SET locked_at = $2, locked_by = $3, updated_at = $2
            WHERE id = $1
              AND locked_at IS NOT DISTINCT FROM $4
              AND failed_at IS NULL
              AND run_at <= $2
              AND (locked_at IS NULL
                   OR locked_at < $2 - make_interval(
                        secs => COALESCE(max_run_time_ms, $5)::double precision / 1000.0))
              AND (cardinality($6::text[]) = 0 OR queue = ANY($6))
              AND ($7::integer IS NULL OR priority >= $7)
              AND ($8::integer IS NULL OR priority <= $8)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(candidate.id.0)
        .bind(criteria.now)
        .bind(&criteria.worker)
        .bind(candidate.locked_at)
        .bind(millis(criteria.max_run_time))
        .bind(&criteria.queues)
        .bind(criteria.min_priority)
        .bind(criteria.max_priority)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(JobRecord::from))
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_jobs
            SET priority = $2, attempts = $3, queue = $4, handler = $5, payload = $6,
                run_at = $7, locked_at = $8, locked_by = $9, failed_at = $10,
                last_error = $11, max_attempts = $12, max_run_time_ms = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(record.id.0)
        .bind(record.priority)
        .bind(to_i32(record.attempts))
        .bind(&record.queue)
        .bind(&record.handler)
        .bind(&record.payload)
        .bind(record.run_at)
        .bind(record.locked_at)
        .bind(&record.locked_by)
        .bind(record.failed_at)
        .bind(&record.last_error)
        .bind(record.max_attempts.map(to_i32))
        .bind(record.max_run_time.map(millis))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeferredError::not_found(record.id));
        }
        Ok(())
    }

    async fn destroy(&self, record: &JobRecord) -> Result<()> {
        sqlx::query("DELETE FROM deferred_jobs WHERE id = $1")
            .bind(record.id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recover_from(&self, error: &DeferredError) -> Result<()> {
        if error.code() == ErrorCode::DatabaseConnectionFailed {
            warn!(
                idle = self.pool.num_idle(),
                size = self.pool.size(),
                "Database connection lost; the pool will reconnect on next use"
            );
        }
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE failed_at IS NULL AND locked_at IS NULL AND run_at <= $1) AS ready,
                COUNT(*) FILTER (WHERE failed_at IS NULL AND locked_at IS NULL AND run_at > $1) AS scheduled,
                COUNT(*) FILTER (WHERE failed_at IS NULL AND locked_at IS NOT NULL) AS locked,
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL) AS failed
            FROM deferred_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn clear(&self, failed_only: bool) -> Result<u64> {
        let sql = if failed_only {
            "DELETE FROM deferred_jobs WHERE failed_at IS NOT NULL"
        } else {
            "DELETE FROM deferred_jobs"
        };
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    priority: i32,
    attempts: i32,
    queue: Option<String>,
    handler: String,
    payload: serde_json::Value,
    run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    max_attempts: Option<i32>,
    max_run_time_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        Self {
            id: JobId(row.id),
            priority: row.priority,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            queue: row.queue,
            handler: row.handler,
            payload: row.payload,
            run_at: row.run_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            failed_at: row.failed_at,
            last_error: row.last_error,
            max_attempts: row.max_attempts.and_then(|v| u32::try_from(v).ok()),
            max_run_time: row
                .max_run_time_ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    ready: i64,
    scheduled: i64,
    locked: i64,
    failed: i64,
}

impl From<StatsRow> for QueueStats {
    fn from(row: StatsRow) -> Self {
        let count = |v: i64| u64::try_from(v).unwrap_or(0);
        Self {
            ready: count(row.ready),
            scheduled: count(row.scheduled),
            locked: count(row.locked),
            failed: count(row.failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion() {
        let now = Utc::now();
        let row = JobRow {
            id: 7,
            priority: 3,
            attempts: 2,
            queue: Some("mail".to_string()),
            handler: "SendMail".to_string(),
            payload: serde_json::json!({"to": "ada@example.com"}),
            run_at: now,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            last_error: Some("timeout".to_string()),
            max_attempts: Some(5),
            max_run_time_ms: Some(1_500),
            created_at: now,
            updated_at: now,
        };

        let record = JobRecord::from(row);
        assert_eq!(record.id, JobId(7));
        assert_eq!(record.attempts, 2);
        assert_eq!(record.max_attempts, Some(5));
        assert_eq!(record.max_run_time, Some(Duration::from_millis(1_500)));
        assert_eq!(record.label(), "Job SendMail (id=7) (queue=mail)");
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }
}
