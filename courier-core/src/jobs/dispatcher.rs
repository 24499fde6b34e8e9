use std::{
    any::{Any, type_name},
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    backoff::{RetryDecision, RetryPolicy},
    catalog::{QueueCatalog, QueueSpec},
    gate::{ConcurrencyGate, ExecutionPermit},
    handler::{HandlerResult, JobContext, JobFailure},
    job::{AttemptEntry, AttemptOutcome, JobRecord},
    registry::HandlerRegistry,
    store::{AttemptResolution, JobStore, NextState},
    telemetry::{JobEvent, JobTelemetry},
};
use crate::error::Result;

/// Process-level knobs shared by every dispatcher of a runtime.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Recorded as `claimed_by` on claimed rows.
    pub worker_id: String,
    /// Time in-flight executions get after shutdown before being abandoned.
    pub shutdown_grace: Duration,
    /// Handler timeout for job types the catalog does not know.
    pub default_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("courier-{}", std::process::id()),
            shutdown_grace: Duration::from_secs(30),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Everything a dispatcher and its executions share.
pub struct DispatchContext<S: JobStore + ?Sized + 'static> {
    pub store: Arc<S>,
    pub catalog: Arc<QueueCatalog>,
    pub registry: Arc<HandlerRegistry>,
    pub gate: Arc<ConcurrencyGate>,
    pub telemetry: Arc<dyn JobTelemetry>,
    pub shutdown: CancellationToken,
    pub settings: DispatchSettings,
}

impl<S: JobStore + ?Sized + 'static> Clone for DispatchContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
            registry: Arc::clone(&self.registry),
            gate: Arc::clone(&self.gate),
            telemetry: Arc::clone(&self.telemetry),
            shutdown: self.shutdown.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: JobStore + ?Sized + 'static> fmt::Debug for DispatchContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("store_type", &type_name::<S>())
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// Periodic poller for a single queue.
pub struct QueueDispatcher<S: JobStore + ?Sized + 'static> {
    spec: QueueSpec,
    ctx: DispatchContext<S>,
}

impl<S: JobStore + ?Sized + 'static> fmt::Debug for QueueDispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queue", self.spec.name())
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl<S: JobStore + ?Sized + 'static> QueueDispatcher<S> {
    pub fn new(spec: QueueSpec, ctx: DispatchContext<S>) -> Self {
        Self { spec, ctx }
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Poll until shutdown, then wait for in-flight executions to wind down.
    pub async fn run(self) {
        let queue = self.spec.name().clone();
        info!(
            queue = %queue,
            priority = self.spec.priority(),
            concurrency = self.spec.concurrency(),
            poll_interval_ms = self.spec.poll_interval().as_millis() as u64,
            global_capacity = ?self.spec.global_semaphore_capacity(),
            "dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.spec.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            while let Some(joined) = inflight.try_join_next() {
                if let Err(err) = joined {
                    error!(queue = %queue, error = %err, "execution task failed");
                }
            }

            if let Err(err) = self.poll_once(&mut inflight).await {
                warn!(queue = %queue, error = %err, "poll cycle failed; retrying next tick");
            }
        }

        self.drain(inflight).await;
        info!(queue = %queue, "dispatcher stopped");
    }

    /// One claim cycle: reserve slots, claim that many jobs, spawn them.
    /// Returns the number of executions started.
    pub async fn poll_once(&self, inflight: &mut JoinSet<()>) -> Result<usize> {
        let queue = self.spec.name();
        let permits = self
            .ctx
            .gate
            .reserve(queue.as_str(), &self.ctx.shutdown)
            .await;
        if permits.is_empty() {
            return Ok(0);
        }

        // Unused permits are released when `permits` drops.
        let jobs = self
            .ctx
            .store
            .claim(queue, permits.len(), &self.ctx.settings.worker_id)
            .await?;

        let mut started = 0;
        for (job, permit) in jobs.into_iter().zip(permits) {
            self.ctx.telemetry.on_claimed(&JobEvent::from(&job));

            let span = info_span!(
                "job",
                job_id = %job.id,
                job_type = %job.job_type,
                queue = %job.queue,
                attempt = job.attempt
            );
            let execution = Execution {
                ctx: self.ctx.clone(),
                retry: self.spec.retry().clone(),
            };
            inflight.spawn(execution.run(job, permit).instrument(span));
            started += 1;
        }
        Ok(started)
    }

    async fn drain(&self, mut inflight: JoinSet<()>) {
        if inflight.is_empty() {
            return;
        }
        let queue = self.spec.name();
        info!(queue = %queue, inflight = inflight.len(), "waiting for in-flight executions");

        // Executions abandon themselves after the grace period; the margin
        // covers writing their outcome.
        let deadline = self.ctx.settings.shutdown_grace + Duration::from_secs(5);
        let joined = tokio::time::timeout(deadline, async {
            while let Some(joined) = inflight.join_next().await {
                if let Err(err) = joined {
                    error!(queue = %queue, error = %err, "execution task failed");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                queue = %queue,
                remaining = inflight.len(),
                "executions outlived shutdown grace; aborting, recovery sweep will reclaim them"
            );
            inflight.abort_all();
        }
    }
}

/// One claimed job from handler invocation to recorded outcome.
struct Execution<S: JobStore + ?Sized + 'static> {
    ctx: DispatchContext<S>,
    retry: RetryPolicy,
}

impl<S: JobStore + ?Sized + 'static> Execution<S> {
    async fn run(self, job: JobRecord, permit: ExecutionPermit) {
        let event = JobEvent::from(&job);
        let started = Instant::now();
        let outcome = self.invoke(&job).await;
        self.resolve(&job, &event, outcome, started.elapsed()).await;
        drop(permit);
    }

    async fn invoke(&self, job: &JobRecord) -> HandlerResult {
        let Some(handler) = self.ctx.registry.get(job.job_type.as_str()) else {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                queue = %job.queue,
                "no handler registered for claimed job type; registry and catalog are out of sync"
            );
            return Err(JobFailure::terminal(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        let timeout = self
            .ctx
            .catalog
            .timeout_for(job.job_type.as_str())
            .unwrap_or(self.ctx.settings.default_timeout);
        let job_ctx = JobContext::new(job, self.ctx.shutdown.child_token());
        let guarded = AssertUnwindSafe(handler.execute(&job_ctx)).catch_unwind();

        let shutdown = &self.ctx.shutdown;
        let grace = self.ctx.settings.shutdown_grace;
        let abandoned = async move {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, guarded) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => Err(JobFailure::retryable(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Err(_) => Err(JobFailure::retryable(format!(
                    "handler timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
            _ = abandoned => Err(JobFailure::retryable("execution interrupted by shutdown")),
        }
    }

    async fn resolve(
        &self,
        job: &JobRecord,
        event: &JobEvent,
        outcome: HandlerResult,
        elapsed: Duration,
    ) {
        let finished_at = Utc::now();
        let telemetry = &self.ctx.telemetry;

        let failure = match outcome {
            Ok(()) => {
                if self
                    .persist(
                        job,
                        NextState::Completed,
                        AttemptOutcome::Completed,
                        None,
                        finished_at,
                    )
                    .await
                {
                    telemetry.on_completed(event, elapsed);
                }
                return;
            }
            Err(failure) => failure,
        };

        telemetry.on_execution_error(event, &failure);
        let decision =
            self.retry
                .decide(job.attempt, failure.retryable, finished_at, &mut rand::rng());

        match decision {
            RetryDecision::Retry { delay, retry_at } => {
                if self
                    .persist(
                        job,
                        NextState::Retry { at: retry_at },
                        AttemptOutcome::RetryScheduled,
                        Some(&failure.message),
                        finished_at,
                    )
                    .await
                {
                    telemetry.on_retry_scheduled(event, retry_at, delay);
                }
            }
            RetryDecision::Exhausted(reason) => {
                if self
                    .persist(
                        job,
                        NextState::Failed,
                        AttemptOutcome::Failed,
                        Some(&failure.message),
                        finished_at,
                    )
                    .await
                {
                    telemetry.on_exhausted(event, reason, &failure.message);
                }
            }
        }
    }

    /// Record the outcome. Whoever records an attempt's outcome reports its
    /// terminal callback, so a `false` here means the callback belongs to the
    /// recovery sweep instead.
    async fn persist(
        &self,
        job: &JobRecord,
        next: NextState,
        outcome: AttemptOutcome,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> bool {
        let resolution = AttemptResolution {
            job_id: job.id,
            attempt: job.attempt,
            next,
            entry: AttemptEntry {
                attempt: job.attempt,
                started_at: job.started_at,
                finished_at,
                outcome,
                error: error.map(str::to_string),
            },
        };

        match self.ctx.store.resolve(resolution).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    "attempt no longer owned by this worker; outcome discarded"
                );
                false
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %err,
                    "failed to record job outcome; the recovery sweep will reclaim it"
                );
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
