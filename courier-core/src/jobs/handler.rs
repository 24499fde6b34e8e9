use std::{fmt, future::Future, marker::PhantomData};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::job::{JobId, JobRecord, JobType, QueueName};

/// Failure reported by a handler. Retryability is decided by the handler,
/// never inferred from an error type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub retryable: bool,
    pub message: String,
}

impl JobFailure {
    /// Transient problem: timeouts, unavailable dependencies.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// Permanent problem: malformed payload, invalid target.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "retryable" } else { "terminal" };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for JobFailure {}

pub type HandlerResult = Result<(), JobFailure>;

/// Everything a handler gets to see about the execution it is running.
#[derive(Clone, Debug)]
pub struct JobContext {
    job_id: JobId,
    job_type: JobType,
    queue: QueueName,
    attempt: u32,
    payload: Value,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(record: &JobRecord, cancellation: CancellationToken) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            queue: record.queue.clone(),
            attempt: record.attempt,
            payload: record.payload.clone(),
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// 1-based number of the execution in progress.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload; a shape mismatch is a terminal failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobFailure> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            JobFailure::terminal(format!("malformed payload for {}: {err}", self.job_type))
        })
    }

    /// Fires when the process is shutting down. Long handlers should stop at
    /// their next checkpoint.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Business logic for one job type. Implementations are invoked concurrently
/// and must not share mutable state across calls.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> fmt::Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("func", &std::any::type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        (self.func)(ctx.clone()).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        func,
        _marker: PhantomData,
    }
}
