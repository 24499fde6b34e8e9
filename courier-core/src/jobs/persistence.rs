//! Postgres-backed job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`
//! statement, so concurrent pollers in any number of processes never pick up
//! the same row. Outcome writes are fenced on `(id, attempt, status)`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions, types::Json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    job::{AttemptEntry, JobId, JobRecord, JobStatus, JobType, NewJob, QueueName},
    memory::ABANDONED_ERROR,
    store::{AttemptResolution, JobStore, NextState, RecoveredJob, StatusCount},
};
use crate::error::{CourierError, Result};

const CLAIM_INDEX: &str = "idx_courier_jobs_claim";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    queue: String,
    payload: serde_json::Value,
    status: String,
    attempt: i32,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    requeued_from: Option<Uuid>,
    attempt_log: Json<Vec<AttemptEntry>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CourierError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: JobId(row.id),
            job_type: JobType::new(row.job_type),
            queue: QueueName::new(row.queue),
            payload: row.payload,
            status: row.status.parse()?,
            attempt: u32::try_from(row.attempt).map_err(|_| {
                CourierError::Internal(format!(
                    "job {} has negative attempt {}",
                    row.id, row.attempt
                ))
            })?,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            claimed_by: row.claimed_by,
            requeued_from: row.requeued_from.map(JobId),
            attempt_log: row.attempt_log.0,
        })
    }
}

fn to_i32(value: impl TryInto<i32>, what: &str) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| CourierError::Internal(format!("{what} does not fit in INTEGER")))
}

/// Durable job store backed by Postgres.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresJobStore {
    /// Wrap an existing pool after verifying DB health and schema.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                CourierError::Internal(format!(
                    "job store failed Postgres health check: {e}"
                ))
            })?;
        info!("Job store connected to Postgres");

        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind(CLAIM_INDEX)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            CourierError::Internal(format!("job store schema validation failed: {e}"))
        })?
        .is_some();

        if !idx_exists {
            return Err(CourierError::Config(format!(
                "required index {CLAIM_INDEX} is missing; run migrations"
            )));
        }

        Ok(Self { pool })
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    /// Apply the bundled migrations.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        crate::MIGRATOR.run(pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobId> {
        sqlx::query(
            r#"
            INSERT INTO courier_jobs
                (id, job_type, queue, payload, status, attempt, scheduled_at, requeued_from)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6)
            "#,
        )
        .bind(job.id.0)
        .bind(job.job_type.as_str())
        .bind(job.queue.as_str())
        .bind(&job.payload)
        .bind(job.scheduled_at)
        .bind(job.requeued_from.map(|id| id.0))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, queue = %job.queue, "job inserted");
        Ok(job.id)
    }

    async fn claim(
        &self,
        queue: &QueueName,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH picked AS (
                SELECT id
                FROM courier_jobs
                WHERE queue = $1
                  AND status IN ('pending', 'retrying')
                  AND scheduled_at <= NOW()
                ORDER BY scheduled_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE courier_jobs AS j
            SET status = 'running',
                attempt = j.attempt + 1,
                started_at = NOW(),
                updated_at = NOW(),
                claimed_by = $3
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.*
            "#,
        )
        .bind(queue.as_str())
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        claimed.sort_by_key(|job| (job.scheduled_at, job.id));

        if !claimed.is_empty() {
            debug!(queue = %queue, worker_id, claimed = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    async fn resolve(&self, resolution: AttemptResolution) -> Result<bool> {
        let status = resolution.next.status();
        let retry_at = match resolution.next {
            NextState::Retry { at } => Some(at),
            _ => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE courier_jobs
            SET status = $3::text,
                scheduled_at = COALESCE($4::timestamptz, scheduled_at),
                finished_at = CASE
                    WHEN $3::text IN ('completed', 'failed') THEN NOW()
                    ELSE NULL
                END,
                last_error = COALESCE($5::text, last_error),
                claimed_by = NULL,
                updated_at = NOW(),
                attempt_log = attempt_log || $6::jsonb
            WHERE id = $1
              AND attempt = $2
              AND status = 'running'
            "#,
        )
        .bind(resolution.job_id.0)
        .bind(to_i32(resolution.attempt, "attempt")?)
        .bind(status.as_str())
        .bind(retry_at)
        .bind(resolution.entry.error.as_deref())
        .bind(Json(vec![&resolution.entry]))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale(
        &self,
        queue: &QueueName,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<RecoveredJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE courier_jobs
            SET status = CASE WHEN attempt >= $3 THEN 'failed' ELSE 'retrying' END,
                scheduled_at = CASE WHEN attempt >= $3 THEN scheduled_at ELSE NOW() END,
                finished_at = CASE WHEN attempt >= $3 THEN NOW() ELSE NULL END,
                last_error = $4::text,
                claimed_by = NULL,
                updated_at = NOW(),
                attempt_log = attempt_log || jsonb_build_array(jsonb_build_object(
                    'attempt', attempt,
                    'started_at', started_at,
                    'finished_at', NOW(),
                    'outcome', 'abandoned',
                    'error', $4::text
                ))
            WHERE queue = $1
              AND status = 'running'
              AND updated_at < $2
            RETURNING *
            "#,
        )
        .bind(queue.as_str())
        .bind(stale_before)
        .bind(to_i32(max_attempts, "max_attempts")?)
        .bind(ABANDONED_ERROR)
        .fetch_all(&self.pool)
        .await?;

        let recovered = rows
            .into_iter()
            .map(|row| {
                let record = JobRecord::try_from(row)?;
                let exhausted = record.status == JobStatus::Failed;
                Ok(RecoveredJob { record, exhausted })
            })
            .collect::<Result<Vec<_>>>()?;

        if !recovered.is_empty() {
            warn!(
                queue = %queue,
                recovered = recovered.len(),
                "recovered stale running jobs"
            );
        }
        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM courier_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT queue, status, COUNT(*)
            FROM courier_jobs
            GROUP BY queue, status
            ORDER BY queue, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(queue, status, count)| {
                Ok(StatusCount {
                    queue: QueueName::new(queue),
                    status: status.parse()?,
                    count: u64::try_from(count).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn requeue_failed(
        &self,
        id: JobId,
        new_id: JobId,
        queue: &QueueName,
    ) -> Result<Option<JobId>> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO courier_jobs
                (id, job_type, queue, payload, status, attempt, scheduled_at, requeued_from)
            SELECT $2, job_type, $3, payload, 'pending', 0, NOW(), id
            FROM courier_jobs
            WHERE id = $1
              AND status = 'failed'
            RETURNING id
            "#,
        )
        .bind(id.0)
        .bind(new_id.0)
        .bind(queue.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.map(JobId))
    }
}
