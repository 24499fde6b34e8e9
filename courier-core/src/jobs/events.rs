use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::{
    backoff::ExhaustReason,
    handler::JobFailure,
    telemetry::{JobEvent, JobTelemetry},
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecyclePayload {
    Claimed,
    Completed {
        elapsed_ms: u64,
    },
    RetryScheduled {
        retry_at: DateTime<Utc>,
        delay_ms: u64,
    },
    Exhausted {
        reason: ExhaustReason,
        error: String,
    },
    ExecutionError {
        retryable: bool,
        message: String,
    },
}

/// One lifecycle notification as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub job: JobEvent,
    pub payload: LifecyclePayload,
}

impl LifecycleEvent {
    /// Whether this event ends the attempt it belongs to.
    pub fn is_terminal_callback(&self) -> bool {
        matches!(
            self.payload,
            LifecyclePayload::Completed { .. }
                | LifecyclePayload::RetryScheduled { .. }
                | LifecyclePayload::Exhausted { .. }
        )
    }
}

/// In-process fan-out of lifecycle events. Escalation routing (pager, chat,
/// email) subscribes here and filters for [`LifecyclePayload::Exhausted`].
/// Slow subscribers lag and lose events rather than blocking dispatch.
pub struct LifecycleEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl fmt::Debug for LifecycleEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl LifecycleEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, job: &JobEvent, payload: LifecyclePayload) {
        // No subscribers is fine.
        let _ = self.sender.send(LifecycleEvent {
            emitted_at: Utc::now(),
            job: job.clone(),
            payload,
        });
    }
}

impl JobTelemetry for LifecycleEventBus {
    fn on_claimed(&self, event: &JobEvent) {
        self.publish(event, LifecyclePayload::Claimed);
    }

    fn on_completed(&self, event: &JobEvent, elapsed: Duration) {
        self.publish(
            event,
            LifecyclePayload::Completed {
                elapsed_ms: elapsed.as_millis() as u64,
            },
        );
    }

    fn on_retry_scheduled(&self, event: &JobEvent, retry_at: DateTime<Utc>, delay: Duration) {
        self.publish(
            event,
            LifecyclePayload::RetryScheduled {
                retry_at,
                delay_ms: delay.as_millis() as u64,
            },
        );
    }

    fn on_exhausted(&self, event: &JobEvent, reason: ExhaustReason, error: &str) {
        self.publish(
            event,
            LifecyclePayload::Exhausted {
                reason,
                error: error.to_string(),
            },
        );
    }

    fn on_execution_error(&self, event: &JobEvent, failure: &JobFailure) {
        self.publish(
            event,
            LifecyclePayload::ExecutionError {
                retryable: failure.retryable,
                message: failure.message.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobId, JobType, QueueName};

    fn event() -> JobEvent {
        JobEvent {
            job_id: JobId::new(),
            job_type: JobType::new("PAYMENT_RECEIPT_EMAIL"),
            queue: QueueName::new("mail"),
            attempt: 5,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_escalations() {
        let bus = LifecycleEventBus::new(8);
        let mut rx = bus.subscribe();
        let job = event();

        bus.on_execution_error(&job, &JobFailure::retryable("smtp timeout"));
        bus.on_exhausted(&job, ExhaustReason::AttemptsExhausted, "smtp timeout");

        let first = rx.recv().await.expect("error event");
        assert!(!first.is_terminal_callback());

        let second = rx.recv().await.expect("exhausted event");
        assert!(second.is_terminal_callback());
        assert_eq!(second.job, job);

        let json = serde_json::to_value(&second).expect("serialize");
        assert_eq!(json["payload"]["type"], "exhausted");
        assert_eq!(json["payload"]["reason"], "attempts_exhausted");
        assert_eq!(json["queue"], "mail");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = LifecycleEventBus::new(0);
        bus.on_claimed(&event());
    }
}
