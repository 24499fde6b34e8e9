//! # Courier Core
//!
//! Durable, multi-queue delayed job dispatch. Producers enqueue typed jobs
//! into a shared store; each process runs one poller per configured queue,
//! claims due work atomically, executes registered handlers under per-queue
//! and process-wide concurrency limits, and reschedules failures with
//! exponential backoff until the attempt budget runs out.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres-backed [`jobs::PostgresJobStore`] and the bundled
//!   [`MIGRATOR`] (enabled by default)
//! - `pg-tests`: integration tests that need a reachable Postgres
//!
//! ## Architecture
//!
//! - [`jobs::QueueCatalog`]: validated queue and job-type configuration
//! - [`jobs::HandlerRegistry`]: job type to handler binding
//! - [`jobs::JobRuntime`]: dispatchers, recovery sweep, graceful shutdown
//! - [`jobs::JobClient`] and [`jobs::JobAdmin`]: enqueue and operator APIs
//! - [`jobs::JobTelemetry`]: lifecycle callbacks for logs, metrics and
//!   escalation
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::jobs::{
//!     DispatchConfig, HandlerRegistry, InMemoryJobStore, JobContext, JobRuntime,
//!     TracingTelemetry, handler_fn,
//! };
//!
//! async fn run(config: DispatchConfig) -> courier_core::Result<()> {
//!     let registry = HandlerRegistry::new().with(
//!         "RSS_FEED_REFRESH",
//!         handler_fn(|ctx: JobContext| async move {
//!             tracing::info!(feed = %ctx.payload()["feed_id"], "refreshing");
//!             Ok(())
//!         }),
//!     )?;
//!
//!     let runtime = JobRuntime::new(
//!         &config,
//!         Arc::new(InMemoryJobStore::new()),
//!         registry,
//!         Arc::new(TracingTelemetry),
//!     )?;
//!     runtime.start().await?;
//!     runtime
//!         .client()
//!         .enqueue("RSS_FEED_REFRESH", serde_json::json!({ "feed_id": 7 }), None)
//!         .await?;
//!     runtime.shutdown().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error types shared by every job component
pub mod error;

/// Job model, dispatch engine and storage backends
pub mod jobs;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{CourierError, Result};
