use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level dispatch configuration. Everything here can be changed without
/// touching code: queue lanes, job type routing, retry policy and recovery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Named dispatch lanes. Each gets its own poller.
    pub queues: Vec<QueueConfig>,
    /// Job type routing. Every job type belongs to exactly one queue.
    pub job_types: Vec<JobTypeConfig>,
    /// Backoff and attempt budget shared by queues without overrides.
    pub retry: RetryConfig,
    /// Detection of executions abandoned by a crashed process.
    pub recovery: RecoveryConfig,
    /// Handler timeout applied when a job type does not declare its own.
    pub default_timeout_ms: u64,
    /// How long in-flight executions get to finish after shutdown is
    /// signalled before they are abandoned and rescheduled.
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            job_types: Vec::new(),
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            default_timeout_ms: 5 * 60 * 1_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// One dispatch lane.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Lower values win when queues contend for the global permit pool.
    pub priority: i32,
    /// Maximum simultaneously executing jobs for this queue.
    pub concurrency: usize,
    /// Delay between claim attempts.
    pub poll_interval_ms: u64,
    /// Process-wide ceiling shared by every queue that declares one. The
    /// limit is per process: N worker processes allow `capacity * N`
    /// concurrent executions cluster wide.
    pub global_semaphore_capacity: Option<usize>,
    /// Overrides `retry.max_attempts` for this queue.
    pub max_attempts: Option<u32>,
    /// Overrides `retry.backoff_base_ms` for this queue.
    pub backoff_base_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 100,
            concurrency: 1,
            poll_interval_ms: 1_000,
            global_semaphore_capacity: None,
            max_attempts: None,
            backoff_base_ms: None,
        }
    }
}

/// Routes a job type to its queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct JobTypeConfig {
    pub name: String,
    pub queue: String,
    /// Upper bound on one handler execution. Exceeding it is a retryable
    /// failure.
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Executions allowed before a job is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further failure.
    pub backoff_base_ms: u64,
    /// Hard cap on a single retry delay.
    pub backoff_max_ms: u64,
    /// Lower bound of the multiplicative jitter band.
    pub jitter_low: f64,
    /// Upper bound of the multiplicative jitter band.
    pub jitter_high: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 30_000,
            backoff_max_ms: 6 * 60 * 60 * 1_000,
            jitter_low: 0.75,
            jitter_high: 1.25,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// A `running` job untouched for longer than this is considered abandoned.
    /// Must exceed every handler timeout plus the shutdown grace.
    pub stale_after_ms: u64,
    /// How often the recovery sweep runs.
    pub sweep_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 15 * 60 * 1_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl RecoveryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
