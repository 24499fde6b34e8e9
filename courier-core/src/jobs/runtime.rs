use std::{
    any::type_name,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    admin::JobAdmin,
    backoff::ExhaustReason,
    catalog::QueueCatalog,
    client::JobClient,
    config::{DispatchConfig, RecoveryConfig},
    dispatcher::{DispatchContext, DispatchSettings, QueueDispatcher},
    gate::ConcurrencyGate,
    memory::ABANDONED_ERROR,
    registry::HandlerRegistry,
    store::JobStore,
    telemetry::{JobEvent, JobTelemetry},
};
use crate::error::{CourierError, Result};

/// Owns one dispatcher per catalog queue plus the stale-job housekeeper.
pub struct JobRuntime<S: JobStore + ?Sized + 'static> {
    ctx: DispatchContext<S>,
    recovery: RecoveryConfig,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: JobStore + ?Sized + 'static> fmt::Debug for JobRuntime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("JobRuntime")
            .field("store_type", &type_name::<S>())
            .field("queues", &self.ctx.catalog.queues().count())
            .field("handlers", &self.ctx.registry.len())
            .field("recovery", &self.recovery)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("task_handle_count", &handle_count)
            .field("shutdown_cancelled", &self.ctx.shutdown.is_cancelled())
            .finish()
    }
}

impl<S: JobStore + ?Sized + 'static> JobRuntime<S> {
    /// Validate `config` and `registry` against each other and assemble the
    /// runtime. Nothing runs until [`JobRuntime::start`].
    pub fn new(
        config: &DispatchConfig,
        store: Arc<S>,
        registry: HandlerRegistry,
        telemetry: Arc<dyn JobTelemetry>,
    ) -> Result<Self> {
        let catalog = QueueCatalog::from_config(config)?;
        registry.validate_against(&catalog)?;

        let gate = ConcurrencyGate::from_catalog(&catalog);
        let settings = DispatchSettings {
            shutdown_grace: config.shutdown_grace(),
            default_timeout: config.default_timeout(),
            ..DispatchSettings::default()
        };

        Ok(Self {
            ctx: DispatchContext {
                store,
                catalog: Arc::new(catalog),
                registry: Arc::new(registry),
                gate: Arc::new(gate),
                telemetry,
                shutdown: CancellationToken::new(),
                settings,
            },
            recovery: config.recovery.clone(),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Override the `claimed_by` identity of this process.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.ctx.settings.worker_id = worker_id.into();
        self
    }

    pub fn catalog(&self) -> &Arc<QueueCatalog> {
        &self.ctx.catalog
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.ctx.gate
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.settings.worker_id
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn client(&self) -> JobClient<S> {
        JobClient::new(Arc::clone(&self.ctx.store), Arc::clone(&self.ctx.catalog))
    }

    pub fn admin(&self) -> JobAdmin<S> {
        JobAdmin::new(Arc::clone(&self.ctx.store), Arc::clone(&self.ctx.catalog))
    }

    /// Spawn the dispatchers and the housekeeper.
    pub async fn start(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(CourierError::InvalidState(
                "runtime has been shut down".into(),
            ));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CourierError::InvalidState(
                "runtime already started".into(),
            ));
        }

        let idle = self.ctx.catalog.idle_queues();
        if !idle.is_empty() {
            warn!(queues = ?idle, "queues without job types will never receive work");
        }

        let mut handles = self.handles.lock().await;
        for spec in self.ctx.catalog.queues() {
            let dispatcher = QueueDispatcher::new(spec.clone(), self.ctx.clone());
            handles.push(tokio::spawn(dispatcher.run()));
        }
        handles.push(self.spawn_housekeeper());

        info!(
            worker_id = %self.ctx.settings.worker_id,
            queues = self.ctx.catalog.queues().count(),
            global_capacity = ?self.ctx.catalog.global_capacity(),
            "job runtime started"
        );
        Ok(())
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let recovery = self.recovery.clone();

        tokio::spawn(async move {
            // Sweep immediately so jobs orphaned by a previous crash come back
            // without waiting a full interval.
            let mut ticker = tokio::time::interval(recovery.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => {
                        info!("housekeeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = sweep(&ctx, recovery.stale_after()).await {
                            warn!(error = %err, "stale job sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// Run one recovery sweep over every queue. Returns the number of jobs
    /// moved out of `running`. A store error on one queue does not stop the
    /// others; the first error is returned once all queues were tried.
    pub async fn recover_stale_once(&self) -> Result<usize> {
        sweep(&self.ctx, self.recovery.stale_after()).await
    }

    /// Stop claiming, let in-flight executions finish within the grace
    /// period, and wait for every task.
    pub async fn shutdown(&self) -> Result<()> {
        info!("initiating graceful shutdown of job runtime");
        self.ctx.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline = self.ctx.settings.shutdown_grace + Duration::from_secs(10);
        for handle in handles {
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "runtime task failed"),
                Err(_) => warn!("runtime task did not stop before the shutdown deadline"),
            }
        }

        info!("job runtime shutdown complete");
        Ok(())
    }
}

async fn sweep<S: JobStore + ?Sized + 'static>(
    ctx: &DispatchContext<S>,
    stale_after: Duration,
) -> Result<usize> {
    let stale_after = TimeDelta::from_std(stale_after)
        .map_err(|_| CourierError::Config("recovery.stale_after_ms is out of range".into()))?;
    let stale_before = Utc::now()
        .checked_sub_signed(stale_after)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut total = 0;
    let mut first_error = None;
    for spec in ctx.catalog.queues() {
        let recovered = match ctx
            .store
            .recover_stale(spec.name(), stale_before, spec.retry().max_attempts())
            .await
        {
            Ok(recovered) => recovered,
            Err(err) => {
                warn!(queue = %spec.name(), error = %err, "stale recovery failed for queue");
                first_error.get_or_insert(err);
                continue;
            }
        };
        total += recovered.len();

        for job in recovered {
            let event = JobEvent::from(&job.record);
            if job.exhausted {
                ctx.telemetry
                    .on_exhausted(&event, ExhaustReason::AttemptsExhausted, ABANDONED_ERROR);
            } else {
                ctx.telemetry
                    .on_retry_scheduled(&event, job.record.scheduled_at, Duration::ZERO);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(total),
    }
}
