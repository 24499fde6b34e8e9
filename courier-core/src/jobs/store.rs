use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{AttemptEntry, JobId, JobRecord, JobStatus, NewJob, QueueName};
use crate::error::Result;

/// Where a resolved attempt leaves the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextState {
    Completed,
    Retry { at: DateTime<Utc> },
    Failed,
}

impl NextState {
    pub fn status(&self) -> JobStatus {
        match self {
            NextState::Completed => JobStatus::Completed,
            NextState::Retry { .. } => JobStatus::Retrying,
            NextState::Failed => JobStatus::Failed,
        }
    }
}

/// Outcome write for one execution attempt. Applied only while the job is
/// still `running` at the same attempt, which fences off late results from
/// executions the recovery sweep has already reclaimed.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptResolution {
    pub job_id: JobId,
    pub attempt: u32,
    pub next: NextState,
    pub entry: AttemptEntry,
}

/// A `running` job the recovery sweep moved back to `retrying` or to `failed`.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveredJob {
    pub record: JobRecord,
    pub exhausted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub queue: QueueName,
    pub status: JobStatus,
    pub count: u64,
}

/// Persistence seam for job records.
///
/// Implementations must make [`JobStore::claim`] atomic: concurrent callers,
/// in this process or another, never receive the same record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<JobId>;

    /// Claim up to `limit` eligible jobs of `queue`, oldest `scheduled_at`
    /// first, marking them `running` and incrementing `attempt`.
    async fn claim(&self, queue: &QueueName, limit: usize, worker_id: &str)
    -> Result<Vec<JobRecord>>;

    /// Persist the outcome of an attempt. Returns `false` when the job is no
    /// longer owned by that attempt.
    async fn resolve(&self, resolution: AttemptResolution) -> Result<bool>;

    /// Move `running` jobs of `queue` not touched since `stale_before` back to
    /// `retrying`, or to `failed` once `max_attempts` is spent.
    async fn recover_stale(
        &self,
        queue: &QueueName,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<RecoveredJob>>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Row counts grouped by queue and status.
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Copy a `failed` job into a fresh `pending` one on `queue`. Returns
    /// `None` when `id` is not a failed job.
    async fn requeue_failed(
        &self,
        id: JobId,
        new_id: JobId,
        queue: &QueueName,
    ) -> Result<Option<JobId>>;
}
