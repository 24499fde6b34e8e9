use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{
    backoff::ExhaustReason,
    handler::JobFailure,
    job::{JobId, JobRecord, JobType, QueueName},
};

/// Identity carried by every telemetry callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: JobType,
    pub queue: QueueName,
    pub attempt: u32,
}

impl From<&JobRecord> for JobEvent {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            queue: record.queue.clone(),
            attempt: record.attempt,
        }
    }
}

/// Lifecycle callbacks invoked by the dispatcher.
///
/// For every execution attempt exactly one of [`on_completed`],
/// [`on_retry_scheduled`] or [`on_exhausted`] is called. `on_claimed`
/// precedes them and `on_execution_error` accompanies every failed attempt.
/// Implementations must not block.
///
/// [`on_completed`]: JobTelemetry::on_completed
/// [`on_retry_scheduled`]: JobTelemetry::on_retry_scheduled
/// [`on_exhausted`]: JobTelemetry::on_exhausted
pub trait JobTelemetry: Send + Sync {
    fn on_claimed(&self, event: &JobEvent);

    fn on_completed(&self, event: &JobEvent, elapsed: Duration);

    fn on_retry_scheduled(&self, event: &JobEvent, retry_at: DateTime<Utc>, delay: Duration);

    /// Escalation point: the job is now terminally `failed`.
    fn on_exhausted(&self, event: &JobEvent, reason: ExhaustReason, error: &str);

    fn on_execution_error(&self, event: &JobEvent, failure: &JobFailure);
}

/// Structured logs plus `metrics` counters. Install a recorder (e.g. the
/// Prometheus exporter) to export the counters; without one they are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    /// Register metric descriptions with the installed recorder.
    pub fn describe_metrics() {
        describe_counter!("courier_jobs_claimed_total", "Jobs claimed for execution");
        describe_counter!("courier_jobs_completed_total", "Jobs completed successfully");
        describe_counter!("courier_jobs_retried_total", "Failed attempts scheduled for retry");
        describe_counter!(
            "courier_jobs_exhausted_total",
            "Jobs marked failed after terminal errors or exhausted retries"
        );
        describe_counter!("courier_job_errors_total", "Failed execution attempts");
        describe_histogram!(
            "courier_job_duration_seconds",
            "Handler execution time of successful attempts"
        );
    }
}

impl JobTelemetry for TracingTelemetry {
    fn on_claimed(&self, event: &JobEvent) {
        debug!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            "job claimed"
        );
        counter!(
            "courier_jobs_claimed_total",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string()
        )
        .increment(1);
    }

    fn on_completed(&self, event: &JobEvent, elapsed: Duration) {
        info!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            "job completed"
        );
        counter!(
            "courier_jobs_completed_total",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string()
        )
        .increment(1);
        histogram!(
            "courier_job_duration_seconds",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    fn on_retry_scheduled(&self, event: &JobEvent, retry_at: DateTime<Utc>, delay: Duration) {
        info!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            retry_at = %retry_at,
            delay_ms = delay.as_millis() as u64,
            "job failed retryable; retry scheduled"
        );
        counter!(
            "courier_jobs_retried_total",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string()
        )
        .increment(1);
    }

    fn on_exhausted(&self, event: &JobEvent, reason: ExhaustReason, error: &str) {
        error!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            ?reason,
            error,
            "job failed permanently"
        );
        counter!(
            "courier_jobs_exhausted_total",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string()
        )
        .increment(1);
    }

    fn on_execution_error(&self, event: &JobEvent, failure: &JobFailure) {
        warn!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            retryable = failure.retryable,
            error = %failure.message,
            "job execution failed"
        );
        counter!(
            "courier_job_errors_total",
            "queue" => event.queue.to_string(),
            "job_type" => event.job_type.to_string(),
            "retryable" => if failure.retryable { "true" } else { "false" }
        )
        .increment(1);
    }
}

/// Forwards every callback to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn JobTelemetry>>,
}

impl fmt::Debug for FanoutTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutTelemetry")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn JobTelemetry>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl JobTelemetry for FanoutTelemetry {
    fn on_claimed(&self, event: &JobEvent) {
        self.sinks.iter().for_each(|sink| sink.on_claimed(event));
    }

    fn on_completed(&self, event: &JobEvent, elapsed: Duration) {
        self.sinks
            .iter()
            .for_each(|sink| sink.on_completed(event, elapsed));
    }

    fn on_retry_scheduled(&self, event: &JobEvent, retry_at: DateTime<Utc>, delay: Duration) {
        self.sinks
            .iter()
            .for_each(|sink| sink.on_retry_scheduled(event, retry_at, delay));
    }

    fn on_exhausted(&self, event: &JobEvent, reason: ExhaustReason, error: &str) {
        self.sinks
            .iter()
            .for_each(|sink| sink.on_exhausted(event, reason, error));
    }

    fn on_execution_error(&self, event: &JobEvent, failure: &JobFailure) {
        self.sinks
            .iter()
            .for_each(|sink| sink.on_execution_error(event, failure));
    }
}
