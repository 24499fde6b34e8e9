pub mod handlers;

use std::{collections::BTreeMap, net::SocketAddr};

use anyhow::{Context, anyhow, bail};
use courier_core::jobs::{DispatchConfig, QueueCatalog};
use serde::{Deserialize, Serialize};
use url::Url;

use handlers::HandlerBinding;

/// Complete worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub database: DatabaseConfig,
    /// Queue catalog, job type routing, retry and recovery policy.
    pub dispatch: DispatchConfig,
    pub telemetry: TelemetryConfig,
    /// Built-in handler per job type, keyed by job type name. Every job type
    /// declared in `dispatch.job_types` needs exactly one binding.
    pub handlers: BTreeMap<String, HandlerBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL. `DATABASE_URL` takes precedence when set.
    pub url: Option<String>,
    /// Upper bound for the connection pool. Each queue poller and each
    /// in-flight execution holds a connection only briefly.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Address for the Prometheus scrape endpoint. Metrics are not exported
    /// when unset.
    pub metrics_listen: Option<SocketAddr>,
    /// Lifecycle events buffered per subscriber before slow subscribers
    /// start losing events.
    pub event_buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_listen: None,
            event_buffer: 1024,
        }
    }
}

impl CourierConfig {
    /// Database URL, failing when none is configured.
    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                anyhow!("no database configured; set DATABASE_URL or database.url")
            })
    }

    /// Check the catalog and the handler bindings before anything connects.
    pub fn validate(&self) -> anyhow::Result<QueueCatalog> {
        let catalog = QueueCatalog::from_config(&self.dispatch)
            .context("invalid dispatch configuration")?;

        let mut problems = Vec::new();
        for spec in catalog.job_types() {
            if !self.handlers.contains_key(spec.job_type().as_str()) {
                problems.push(format!("job type {} has no handler binding", spec.job_type()));
            }
        }
        for (job_type, binding) in &self.handlers {
            if catalog.job_type(job_type).is_none() {
                problems.push(format!(
                    "handler binding for {job_type} does not match any declared job type"
                ));
            }
            if let Err(err) = binding.validate() {
                problems.push(format!("handler binding for {job_type}: {err}"));
            }
        }

        if let Some(url) = self.database.url.as_deref().filter(|url| !url.trim().is_empty()) {
            match Url::parse(url.trim()) {
                Ok(parsed) if matches!(parsed.scheme(), "postgres" | "postgresql") => {}
                Ok(parsed) => problems.push(format!(
                    "database.url must use postgres://, got {}://",
                    parsed.scheme()
                )),
                Err(err) => problems.push(format!("database.url is not a valid URL: {err}")),
            }
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be positive".to_string());
        }

        if !problems.is_empty() {
            bail!("invalid courier config: {}", problems.join("; "));
        }
        Ok(catalog)
    }
}
