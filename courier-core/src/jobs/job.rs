use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{borrow::Borrow, fmt, str::FromStr};
use uuid::Uuid;

use crate::error::CourierError;

/// Unique identifier for persisted jobs.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|err| CourierError::InvalidId(format!("{s}: {err}")))
    }
}

/// Identifier selecting the handler for a job, e.g. `RSS_FEED_REFRESH`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for JobType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Name of a dispatch lane in the queue catalog.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Persisted lifecycle state.
///
/// `pending -> running -> {completed | retrying | failed}` and
/// `retrying -> running`. `completed` and `failed` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// States a claim may pick up once `scheduled_at` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(CourierError::Internal(format!(
                "unknown job status in store: {other}"
            ))),
        }
    }
}

/// How a single execution attempt ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    RetryScheduled,
    Failed,
    /// The worker never reported back; recovered by the stale sweep.
    Abandoned,
}

/// One row of a job's attempt history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A job as stored, including its audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub queue: QueueName,
    pub payload: Value,
    pub status: JobStatus,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub requeued_from: Option<JobId>,
    pub attempt_log: Vec<AttemptEntry>,
}

impl JobRecord {
    /// Materialise a freshly inserted record.
    pub fn from_new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            queue: job.queue,
            payload: job.payload,
            status: JobStatus::Pending,
            attempt: 0,
            scheduled_at: job.scheduled_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            claimed_by: None,
            requeued_from: job.requeued_from,
            attempt_log: Vec::new(),
        }
    }
}

/// Insert request produced by the enqueue API once the job type has been
/// resolved against the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: JobType,
    pub queue: QueueName,
    pub payload: Value,
    pub scheduled_at: DateTime<Utc>,
    pub requeued_from: Option<JobId>,
}

impl NewJob {
    pub fn new(
        job_type: JobType,
        queue: QueueName,
        payload: Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            queue,
            payload,
            scheduled_at,
            requeued_from: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_storage_name() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("leased".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        let terminal: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::is_terminal)
            .collect();
        assert_eq!(terminal, vec![JobStatus::Completed, JobStatus::Failed]);
        assert!(JobStatus::Retrying.is_claimable());
        assert!(!JobStatus::Running.is_claimable());
    }

    #[test]
    fn attempt_entry_omits_missing_error() {
        let entry = AttemptEntry {
            attempt: 1,
            started_at: None,
            finished_at: Utc::now(),
            outcome: AttemptOutcome::RetryScheduled,
            error: None,
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["outcome"], "retry_scheduled");
        assert!(json.get("error").is_none());
    }
}
