use std::{any::type_name, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::debug;

use super::{
    catalog::QueueCatalog,
    job::{JobId, JobType, NewJob},
    store::JobStore,
};
use crate::error::{CourierError, Result};

/// Enqueue API for producers.
///
/// Routing comes from the catalog; callers only name the job type.
pub struct JobClient<S: JobStore + ?Sized + 'static> {
    store: Arc<S>,
    catalog: Arc<QueueCatalog>,
}

impl<S: JobStore + ?Sized + 'static> Clone for JobClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
        }
    }
}

impl<S: JobStore + ?Sized + 'static> fmt::Debug for JobClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobClient")
            .field("store_type", &type_name::<S>())
            .field("job_types", &self.catalog.job_types().count())
            .finish()
    }
}

impl<S: JobStore + ?Sized + 'static> JobClient<S> {
    pub fn new(store: Arc<S>, catalog: Arc<QueueCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Persist a new `pending` job. `scheduled_at` defaults to now; a time in
    /// the past is accepted and makes the job immediately eligible.
    ///
    /// The payload must be a JSON object (`null` is stored as `{}`).
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        let queue = self.catalog.queue_for(job_type)?;

        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => payload,
            other => {
                return Err(CourierError::InvalidPayload(format!(
                    "payload for {job_type} must be a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };

        let job = NewJob::new(
            JobType::new(job_type),
            queue.name().clone(),
            payload,
            scheduled_at.unwrap_or_else(Utc::now),
        );
        let scheduled_at = job.scheduled_at;
        let id = self.store.insert(job).await?;

        debug!(
            job_id = %id,
            job_type,
            queue = %queue.name(),
            scheduled_at = %scheduled_at,
            "job enqueued"
        );
        Ok(id)
    }

    /// Enqueue with `scheduled_at = now + delay`.
    pub async fn enqueue_in(
        &self,
        job_type: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<JobId> {
        let delay = TimeDelta::from_std(delay)
            .map_err(|_| CourierError::InvalidPayload(format!("delay {delay:?} is out of range")))?;
        let scheduled_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| CourierError::InvalidPayload("delay overflows the calendar".into()))?;
        self.enqueue(job_type, payload, Some(scheduled_at)).await
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        config::{DispatchConfig, JobTypeConfig, QueueConfig},
        job::JobStatus,
        memory::InMemoryJobStore,
    };
    use serde_json::json;

    fn client() -> (Arc<InMemoryJobStore>, JobClient<InMemoryJobStore>) {
        let config = DispatchConfig {
            queues: vec![QueueConfig {
                name: "ai".into(),
                ..QueueConfig::default()
            }],
            job_types: vec![JobTypeConfig {
                name: "AI_SUMMARY".into(),
                queue: "ai".into(),
                timeout_ms: None,
            }],
            ..DispatchConfig::default()
        };
        let store = Arc::new(InMemoryJobStore::new());
        let catalog = Arc::new(QueueCatalog::from_config(&config).expect("catalog"));
        (Arc::clone(&store), JobClient::new(store, catalog))
    }

    #[tokio::test]
    async fn routes_by_job_type() {
        let (store, client) = client();
        let id = client
            .enqueue("AI_SUMMARY", json!({ "article_id": 42 }), None)
            .await
            .expect("enqueue");

        let record = store.get(id).await.expect("get").expect("record");
        assert_eq!(record.queue.as_str(), "ai");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.payload["article_id"], 42);
    }

    #[tokio::test]
    async fn unknown_job_type_is_rejected_without_a_record() {
        let (store, client) = client();
        let err = client
            .enqueue("NOT_A_TYPE", json!({}), None)
            .await
            .expect_err("unknown type");
        assert!(matches!(err, CourierError::UnknownJobType(name) if name == "NOT_A_TYPE"));
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let (_, client) = client();
        let err = client
            .enqueue("AI_SUMMARY", json!([1, 2]), None)
            .await
            .expect_err("array payload");
        assert!(matches!(err, CourierError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn delayed_enqueue_is_not_claimable_yet() {
        let (store, client) = client();
        client
            .enqueue_in("AI_SUMMARY", Value::Null, Duration::from_secs(3600))
            .await
            .expect("enqueue");

        let claimed = store
            .claim(&"ai".into(), 10, "w")
            .await
            .expect("claim");
        assert!(claimed.is_empty());
    }
}
