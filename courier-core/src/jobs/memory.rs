use std::{collections::BTreeMap, collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    job::{AttemptEntry, AttemptOutcome, JobId, JobRecord, JobStatus, NewJob, QueueName},
    store::{AttemptResolution, JobStore, NextState, RecoveredJob, StatusCount},
};
use crate::error::Result;

pub(crate) const ABANDONED_ERROR: &str =
    "execution abandoned: no outcome recorded before the staleness threshold";

/// Process-local [`JobStore`]. Every operation runs under one lock, which
/// makes claims trivially atomic. Used by tests and single-process
/// deployments that do not need durability.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.jobs.try_lock().map(|jobs| jobs.len()).ok();
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &len)
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record, oldest first.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<_> = jobs.values().cloned().collect();
        records.sort_by_key(|record| (record.created_at, record.id));
        records
    }

    pub async fn count_with_status(&self, status: JobStatus) -> usize {
        let jobs = self.jobs.lock().await;
        jobs.values().filter(|job| job.status == status).count()
    }

    /// Move a job's eligibility time, so tests can skip a backoff delay.
    #[cfg(test)]
    pub(crate) async fn reschedule(&self, id: JobId, at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().await.get_mut(&id) {
            job.scheduled_at = at;
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobId> {
        let id = job.id;
        let record = JobRecord::from_new(job, Utc::now());
        self.jobs.lock().await.insert(id, record);
        Ok(id)
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

        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut eligible: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|job| {
                job.queue == *queue && job.status.is_claimable() && job.scheduled_at <= now
            })
            .map(|job| (job.scheduled_at, job.id))
            .collect();
        eligible.sort_unstable();
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.attempt += 1;
                job.started_at = Some(now);
                job.updated_at = now;
                job.claimed_by = Some(worker_id.to_string());
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn resolve(&self, resolution: AttemptResolution) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&resolution.job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running || job.attempt != resolution.attempt {
            return Ok(false);
        }

        job.status = resolution.next.status();
        if let NextState::Retry { at } = resolution.next {
            job.scheduled_at = at;
        }
        job.finished_at = job.status.is_terminal().then_some(now);
        if let Some(error) = resolution.entry.error.clone() {
            job.last_error = Some(error);
        }
        job.updated_at = now;
        job.claimed_by = None;
        job.attempt_log.push(resolution.entry);
        Ok(true)
    }

    async fn recover_stale(
        &self,
        queue: &QueueName,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<RecoveredJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let mut recovered = Vec::new();

        for job in jobs.values_mut() {
            if job.queue != *queue
                || job.status != JobStatus::Running
                || job.updated_at >= stale_before
            {
                continue;
            }

            let exhausted = job.attempt >= max_attempts;
            job.attempt_log.push(AttemptEntry {
                attempt: job.attempt,
                started_at: job.started_at,
                finished_at: now,
                outcome: AttemptOutcome::Abandoned,
                error: Some(ABANDONED_ERROR.to_string()),
            });
            job.last_error = Some(ABANDONED_ERROR.to_string());
            job.claimed_by = None;
            job.updated_at = now;
            if exhausted {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            } else {
                job.status = JobStatus::Retrying;
                job.scheduled_at = now;
            }
            recovered.push(RecoveredJob {
                record: job.clone(),
                exhausted,
            });
        }
        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let jobs = self.jobs.lock().await;
        let mut counts: BTreeMap<(QueueName, JobStatus), u64> = BTreeMap::new();
        for job in jobs.values() {
            *counts.entry((job.queue.clone(), job.status)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((queue, status), count)| StatusCount {
                queue,
                status,
                count,
            })
            .collect())
    }

    async fn requeue_failed(
        &self,
        id: JobId,
        new_id: JobId,
        queue: &QueueName,
    ) -> Result<Option<JobId>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let Some(original) = jobs.get(&id).filter(|job| job.status == JobStatus::Failed)
        else {
            return Ok(None);
        };

        let copy = NewJob {
            id: new_id,
            job_type: original.job_type.clone(),
            queue: queue.clone(),
            payload: original.payload.clone(),
            scheduled_at: now,
            requeued_from: Some(id),
        };
        jobs.insert(new_id, JobRecord::from_new(copy, now));
        Ok(Some(new_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobType;
    use serde_json::json;
    use std::{collections::HashSet, sync::Arc};

    fn new_job(queue: &str, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob::new(
            JobType::new("RSS_FEED_REFRESH"),
            QueueName::new(queue),
            json!({ "feed_id": 7 }),
            scheduled_at,
        )
    }

    fn entry(attempt: u32, outcome: AttemptOutcome) -> AttemptEntry {
        AttemptEntry {
            attempt,
            started_at: None,
            finished_at: Utc::now(),
            outcome,
            error: None,
        }
    }

    #[tokio::test]
    async fn claim_orders_by_schedule_and_skips_future_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let later = store
            .insert(new_job("feeds", now - chrono::Duration::seconds(5)))
            .await
            .expect("insert");
        let earlier = store
            .insert(new_job("feeds", now - chrono::Duration::seconds(60)))
            .await
            .expect("insert");
        store
            .insert(new_job("feeds", now + chrono::Duration::hours(1)))
            .await
            .expect("insert");
        store
            .insert(new_job("other", now - chrono::Duration::seconds(60)))
            .await
            .expect("insert");

        let claimed = store
            .claim(&QueueName::new("feeds"), 10, "worker-a")
            .await
            .expect("claim");
        let ids: Vec<_> = claimed.iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![earlier, later]);
        assert!(claimed.iter().all(|job| job.attempt == 1));
        assert!(claimed.iter().all(|job| job.status == JobStatus::Running));
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_job() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..200 {
            store
                .insert(new_job("feeds", Utc::now()))
                .await
                .expect("insert");
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store
                        .claim(&QueueName::new("feeds"), 7, &format!("w{worker}"))
                        .await
                        .expect("claim");
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|job| job.id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.expect("join") {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn resolution_is_fenced_by_attempt() {
        let store = InMemoryJobStore::new();
        let id = store.insert(new_job("feeds", Utc::now())).await.expect("insert");
        store
            .claim(&QueueName::new("feeds"), 1, "w")
            .await
            .expect("claim");

        let stale = AttemptResolution {
            job_id: id,
            attempt: 2,
            next: NextState::Completed,
            entry: entry(2, AttemptOutcome::Completed),
        };
        assert!(!store.resolve(stale).await.expect("resolve"));

        let current = AttemptResolution {
            job_id: id,
            attempt: 1,
            next: NextState::Completed,
            entry: entry(1, AttemptOutcome::Completed),
        };
        assert!(store.resolve(current.clone()).await.expect("resolve"));
        assert!(!store.resolve(current).await.expect("second resolve"));

        let record = store.get(id).await.expect("get").expect("exists");
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.finished_at.is_some());
        assert_eq!(record.attempt_log.len(), 1);
        assert!(
            store
                .claim(&QueueName::new("feeds"), 1, "w")
                .await
                .expect("claim")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn stale_running_jobs_are_recovered_or_failed() {
        let store = InMemoryJobStore::new();
        let queue = QueueName::new("feeds");
        let first = store.insert(new_job("feeds", Utc::now())).await.expect("insert");
        let second = store.insert(new_job("feeds", Utc::now())).await.expect("insert");
        store.claim(&queue, 2, "crashed").await.expect("claim");

        // Pretend `second` already used its whole budget.
        store.jobs.lock().await.get_mut(&second).expect("second").attempt = 3;

        let horizon = Utc::now() + chrono::Duration::seconds(1);
        let recovered = store.recover_stale(&queue, horizon, 3).await.expect("sweep");
        assert_eq!(recovered.len(), 2);

        let first = store.get(first).await.expect("get").expect("first");
        assert_eq!(first.status, JobStatus::Retrying);
        assert_eq!(first.attempt, 1);
        assert_eq!(
            first.attempt_log.last().map(|e| e.outcome),
            Some(AttemptOutcome::Abandoned)
        );

        let second = store.get(second).await.expect("get").expect("second");
        assert_eq!(second.status, JobStatus::Failed);

        let again = store.claim(&queue, 5, "fresh").await.expect("claim");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn requeue_copies_failed_job_only() {
        let store = InMemoryJobStore::new();
        let queue = QueueName::new("feeds");
        let id = store.insert(new_job("feeds", Utc::now())).await.expect("insert");

        assert_eq!(
            store
                .requeue_failed(id, JobId::new(), &queue)
                .await
                .expect("requeue"),
            None
        );

        store.claim(&queue, 1, "w").await.expect("claim");
        store
            .resolve(AttemptResolution {
                job_id: id,
                attempt: 1,
                next: NextState::Failed,
                entry: entry(1, AttemptOutcome::Failed),
            })
            .await
            .expect("fail");

        let copy = store
            .requeue_failed(id, JobId::new(), &queue)
            .await
            .expect("requeue")
            .expect("copied");
        let record = store.get(copy).await.expect("get").expect("copy");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.requeued_from, Some(id));

        let counts = store.status_counts().await.expect("counts");
        assert!(counts.contains(&StatusCount {
            queue: queue.clone(),
            status: JobStatus::Failed,
            count: 1
        }));
        assert!(counts.contains(&StatusCount {
            queue,
            status: JobStatus::Pending,
            count: 1
        }));
    }
}
