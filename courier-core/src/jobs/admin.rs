use std::{any::type_name, collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;
use tracing::info;

use super::{
    catalog::QueueCatalog,
    job::{JobId, JobRecord, JobStatus, QueueName},
    store::JobStore,
};
use crate::error::{CourierError, Result};

/// Per-status row counts for one queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueBacklog {
    pub pending: u64,
    pub running: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueBacklog {
    fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += count;
    }

    /// Jobs that still need work.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.running + self.retrying
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BacklogReport {
    /// Every catalog queue, plus any queue name still present in storage.
    pub queues: BTreeMap<QueueName, QueueBacklog>,
}

impl BacklogReport {
    pub fn queue(&self, name: &str) -> Option<&QueueBacklog> {
        self.queues.get(name)
    }

    /// Queue names found in storage that the catalog no longer declares.
    /// Their rows are never claimed.
    pub fn orphaned<'a>(
        &'a self,
        catalog: &'a QueueCatalog,
    ) -> impl Iterator<Item = &'a QueueName> {
        self.queues
            .keys()
            .filter(move |name| catalog.queue(name.as_str()).is_none())
    }
}

/// Operator surface: backlog counts, inspection, manual requeue of failed
/// jobs.
pub struct JobAdmin<S: JobStore + ?Sized + 'static> {
    store: Arc<S>,
    catalog: Arc<QueueCatalog>,
}

impl<S: JobStore + ?Sized + 'static> Clone for JobAdmin<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
        }
    }
}

impl<S: JobStore + ?Sized + 'static> fmt::Debug for JobAdmin<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAdmin")
            .field("store_type", &type_name::<S>())
            .finish()
    }
}

impl<S: JobStore + ?Sized + 'static> JobAdmin<S> {
    pub fn new(store: Arc<S>, catalog: Arc<QueueCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &QueueCatalog {
        &self.catalog
    }

    pub async fn backlog(&self) -> Result<BacklogReport> {
        let mut report = BacklogReport::default();
        for spec in self.catalog.queues() {
            report.queues.insert(spec.name().clone(), QueueBacklog::default());
        }
        for row in self.store.status_counts().await? {
            report
                .queues
                .entry(row.queue)
                .or_default()
                .add(row.status, row.count);
        }
        Ok(report)
    }

    pub async fn inspect(&self, id: JobId) -> Result<JobRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CourierError::NotFound(format!("job {id}")))
    }

    /// Create a fresh `pending` copy of a `failed` job on the queue its job
    /// type currently routes to. The failed record stays as history.
    pub async fn requeue(&self, id: JobId) -> Result<JobId> {
        let record = self.inspect(id).await?;
        if record.status != JobStatus::Failed {
            return Err(CourierError::InvalidState(format!(
                "job {id} is {}; only failed jobs can be requeued",
                record.status
            )));
        }

        let queue = self.catalog.queue_for(record.job_type.as_str())?.name().clone();
        let new_id = self
            .store
            .requeue_failed(id, JobId::new(), &queue)
            .await?
            .ok_or_else(|| {
                CourierError::InvalidState(format!("job {id} changed state during requeue"))
            })?;

        info!(
            job_id = %id,
            new_job_id = %new_id,
            job_type = %record.job_type,
            queue = %queue,
            "failed job requeued"
        );
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        config::{DispatchConfig, JobTypeConfig, QueueConfig},
        job::{AttemptEntry, AttemptOutcome, JobType, NewJob},
        memory::InMemoryJobStore,
        store::{AttemptResolution, NextState},
    };
    use chrono::Utc;
    use serde_json::json;

    fn admin() -> (Arc<InMemoryJobStore>, JobAdmin<InMemoryJobStore>) {
        let config = DispatchConfig {
            queues: vec![
                QueueConfig {
                    name: "feeds".into(),
                    ..QueueConfig::default()
                },
                QueueConfig {
                    name: "mail".into(),
                    ..QueueConfig::default()
                },
            ],
            job_types: vec![JobTypeConfig {
                name: "RSS_FEED_REFRESH".into(),
                queue: "feeds".into(),
                timeout_ms: None,
            }],
            ..DispatchConfig::default()
        };
        let store = Arc::new(InMemoryJobStore::new());
        let catalog = Arc::new(QueueCatalog::from_config(&config).expect("catalog"));
        (Arc::clone(&store), JobAdmin::new(store, catalog))
    }

    async fn failed_job(store: &InMemoryJobStore) -> JobId {
        let id = store
            .insert(NewJob::new(
                JobType::new("RSS_FEED_REFRESH"),
                QueueName::new("feeds"),
                json!({ "feed_id": 9 }),
                Utc::now(),
            ))
            .await
            .expect("insert");
        let claimed = store
            .claim(&QueueName::new("feeds"), 1, "w")
            .await
            .expect("claim");
        let job = &claimed[0];
        let applied = store
            .resolve(AttemptResolution {
                job_id: id,
                attempt: job.attempt,
                next: NextState::Failed,
                entry: AttemptEntry {
                    attempt: job.attempt,
                    started_at: job.started_at,
                    finished_at: Utc::now(),
                    outcome: AttemptOutcome::Failed,
                    error: Some("feed gone".into()),
                },
            })
            .await
            .expect("resolve");
        assert!(applied);
        id
    }

    #[tokio::test]
    async fn backlog_lists_empty_catalog_queues() {
        let (store, admin) = admin();
        failed_job(&store).await;

        let report = admin.backlog().await.expect("backlog");
        assert_eq!(report.queue("feeds").map(|q| q.failed), Some(1));
        assert_eq!(report.queue("mail"), Some(&QueueBacklog::default()));
        assert_eq!(report.orphaned(admin.catalog()).count(), 0);
    }

    #[tokio::test]
    async fn requeue_creates_new_pending_record() {
        let (store, admin) = admin();
        let id = failed_job(&store).await;

        let new_id = admin.requeue(id).await.expect("requeue");
        assert_ne!(new_id, id);

        let copy = admin.inspect(new_id).await.expect("copy");
        assert_eq!(copy.status, JobStatus::Pending);
        assert_eq!(copy.attempt, 0);
        assert_eq!(copy.requeued_from, Some(id));
        assert_eq!(copy.payload, json!({ "feed_id": 9 }));

        let original = admin.inspect(id).await.expect("original");
        assert_eq!(original.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn requeue_rejects_non_failed_and_missing_jobs() {
        let (store, admin) = admin();
        let pending = store
            .insert(NewJob::new(
                JobType::new("RSS_FEED_REFRESH"),
                QueueName::new("feeds"),
                json!({}),
                Utc::now(),
            ))
            .await
            .expect("insert");

        assert!(matches!(
            admin.requeue(pending).await,
            Err(CourierError::InvalidState(_))
        ));
        assert!(matches!(
            admin.requeue(JobId::new()).await,
            Err(CourierError::NotFound(_))
        ));
    }
}
