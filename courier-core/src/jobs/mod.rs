pub mod admin;
pub mod backoff;
pub mod catalog;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod gate;
pub mod handler;
pub mod job;
pub mod memory;
#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use admin::{BacklogReport, JobAdmin, QueueBacklog};
pub use backoff::{ExhaustReason, JitterBand, RetryDecision, RetryPolicy};
pub use catalog::{JobTypeSpec, QueueCatalog, QueueSpec};
pub use client::JobClient;
pub use config::{DispatchConfig, JobTypeConfig, QueueConfig, RecoveryConfig, RetryConfig};
pub use dispatcher::{DispatchContext, DispatchSettings, QueueDispatcher};
pub use events::{LifecycleEvent, LifecycleEventBus, LifecyclePayload};
pub use gate::{ConcurrencyGate, ExecutionPermit, GlobalPermit, PriorityGate};
pub use handler::{FnHandler, HandlerResult, JobContext, JobFailure, JobHandler, handler_fn};
pub use job::{
    AttemptEntry, AttemptOutcome, JobId, JobRecord, JobStatus, JobType, NewJob, QueueName,
};
pub use memory::InMemoryJobStore;
#[cfg(feature = "database")]
pub use persistence::PostgresJobStore;
pub use registry::HandlerRegistry;
pub use runtime::JobRuntime;
pub use store::{AttemptResolution, JobStore, NextState, RecoveredJob, StatusCount};
pub use telemetry::{FanoutTelemetry, JobEvent, JobTelemetry, TracingTelemetry};
