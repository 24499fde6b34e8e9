use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use courier_config::CourierConfig;
use courier_core::jobs::{
    FanoutTelemetry, JobTelemetry, LifecycleEventBus, PostgresJobStore, TracingTelemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Serve Prometheus metrics on `listen`; a no-op when unset.
pub fn install_metrics(listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let Some(addr) = listen else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start prometheus exporter on {addr}"))?;
    TracingTelemetry::describe_metrics();

    info!(%addr, "prometheus exporter listening");
    Ok(())
}

/// Connect to Postgres without touching the schema.
pub async fn connect_pool(config: &CourierConfig) -> anyhow::Result<sqlx::PgPool> {
    let url = config.database_url()?;
    PostgresJobStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")
}

pub async fn connect_store(config: &CourierConfig) -> anyhow::Result<Arc<PostgresJobStore>> {
    let pool = connect_pool(config).await?;
    let store = PostgresJobStore::new(pool)
        .await
        .context("job store is not ready")?;
    Ok(Arc::new(store))
}

/// Logs and metrics, plus the lifecycle bus that escalation consumers
/// subscribe to.
pub fn telemetry(bus: &Arc<LifecycleEventBus>) -> Arc<dyn JobTelemetry> {
    Arc::new(
        FanoutTelemetry::new()
            .with(Arc::new(TracingTelemetry))
            .with(Arc::clone(bus) as Arc<dyn JobTelemetry>),
    )
}

/// Write every lifecycle event to stdout as one JSON line, for piping into
/// external alert routing.
pub fn spawn_event_printer(bus: &LifecycleEventBus, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(error = %err, "failed to serialize lifecycle event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event printer lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => result.context("failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.context("failed to listen for Ctrl-C")?;

    info!("shutdown signal received");
    Ok(())
}
