use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use super::{
    backoff::{JitterBand, RetryPolicy},
    config::DispatchConfig,
    job::{JobType, QueueName},
};
use crate::error::{CourierError, Result};

/// Resolved settings for one dispatch lane.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueSpec {
    name: QueueName,
    priority: i32,
    concurrency: usize,
    poll_interval: Duration,
    global_semaphore_capacity: Option<usize>,
    retry: RetryPolicy,
}

impl QueueSpec {
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn global_semaphore_capacity(&self) -> Option<usize> {
        self.global_semaphore_capacity
    }

    /// Whether executions on this queue also hold a global permit.
    pub fn is_globally_gated(&self) -> bool {
        self.global_semaphore_capacity.is_some()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobTypeSpec {
    job_type: JobType,
    queue: QueueName,
    timeout: Duration,
}

impl JobTypeSpec {
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Static routing table: job type to queue, and per-queue dispatch limits.
/// Built once at start-up; there is no mutation API.
#[derive(Clone, Debug)]
pub struct QueueCatalog {
    queues: HashMap<QueueName, QueueSpec>,
    job_types: HashMap<JobType, JobTypeSpec>,
    /// Queue names ordered by priority, then name.
    order: Vec<QueueName>,
    global_capacity: Option<usize>,
}

impl QueueCatalog {
    /// Validate and resolve the dispatch configuration. Every problem found is
    /// reported in a single [`CourierError::Config`].
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let mut problems = Vec::new();

        if config.queues.is_empty() {
            problems.push("no queues configured".to_string());
        }

        let retry = &config.retry;
        let jitter = JitterBand::new(retry.jitter_low, retry.jitter_high);
        if jitter.is_none() {
            problems.push(format!(
                "retry jitter band [{}, {}] must satisfy 0 < low <= high",
                retry.jitter_low, retry.jitter_high
            ));
        }
        let base_policy = RetryPolicy::from_config(retry);

        let mut queues = HashMap::new();
        let mut global_capacity: Option<usize> = None;

        for queue in &config.queues {
            let name = queue.name.trim();
            if name.is_empty() {
                problems.push("queue with empty name".to_string());
                continue;
            }
            if queue.concurrency == 0 {
                problems.push(format!("queue {name}: concurrency must be at least 1"));
            }
            if queue.poll_interval_ms == 0 {
                problems.push(format!("queue {name}: poll_interval_ms must be positive"));
            }

            let max_attempts = queue.max_attempts.unwrap_or(retry.max_attempts);
            if max_attempts == 0 {
                problems.push(format!("queue {name}: max_attempts must be at least 1"));
            }
            let base_ms = queue.backoff_base_ms.unwrap_or(retry.backoff_base_ms);
            if base_ms == 0 {
                problems.push(format!("queue {name}: backoff base must be positive"));
            }

            if let Some(capacity) = queue.global_semaphore_capacity {
                if capacity == 0 {
                    problems.push(format!(
                        "queue {name}: global_semaphore_capacity must be at least 1"
                    ));
                }
                match global_capacity {
                    Some(existing) if existing != capacity => problems.push(format!(
                        "queue {name}: global_semaphore_capacity {capacity} disagrees \
                         with previously declared {existing}; the global pool is shared"
                    )),
                    _ => global_capacity = Some(capacity),
                }
            }

            let spec = QueueSpec {
                name: QueueName::new(name),
                priority: queue.priority,
                concurrency: queue.concurrency,
                poll_interval: Duration::from_millis(queue.poll_interval_ms),
                global_semaphore_capacity: queue.global_semaphore_capacity,
                retry: base_policy
                    .clone()
                    .with_max_attempts(max_attempts)
                    .with_base(Duration::from_millis(base_ms)),
            };

            if queues.insert(spec.name.clone(), spec).is_some() {
                problems.push(format!("duplicate queue {name}"));
            }
        }

        let mut job_types = HashMap::new();
        let mut longest_timeout = Duration::ZERO;
        for entry in &config.job_types {
            let name = entry.name.trim();
            if name.is_empty() {
                problems.push("job type with empty name".to_string());
                continue;
            }
            let queue = entry.queue.trim();
            if !queues.contains_key(queue) {
                problems.push(format!(
                    "job type {name} is mapped to unknown queue '{queue}'"
                ));
            }

            let timeout = entry
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.default_timeout());
            if timeout.is_zero() {
                problems.push(format!("job type {name}: timeout must be positive"));
            }
            longest_timeout = longest_timeout.max(timeout);

            let spec = JobTypeSpec {
                job_type: JobType::new(name),
                queue: QueueName::new(queue),
                timeout,
            };
            if job_types.insert(spec.job_type.clone(), spec).is_some() {
                problems.push(format!("job type {name} is declared more than once"));
            }
        }

        let stale_after = config.recovery.stale_after();
        let required = longest_timeout + config.shutdown_grace();
        if stale_after <= required {
            problems.push(format!(
                "recovery.stale_after_ms ({}) must exceed the longest handler timeout \
                 plus shutdown grace ({})",
                stale_after.as_millis(),
                required.as_millis()
            ));
        }
        if config.recovery.sweep_interval_ms == 0 {
            problems.push("recovery.sweep_interval_ms must be positive".to_string());
        }

        if !problems.is_empty() {
            return Err(CourierError::Config(problems.join("; ")));
        }

        let mut order: Vec<QueueName> = queues.keys().cloned().collect();
        order.sort_by(|a, b| {
            let pa = queues.get(a).map(QueueSpec::priority);
            let pb = queues.get(b).map(QueueSpec::priority);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });

        Ok(Self {
            queues,
            job_types,
            order,
            global_capacity,
        })
    }

    /// Queue designated for `job_type`.
    pub fn queue_for(&self, job_type: &str) -> Result<&QueueSpec> {
        let spec = self
            .job_types
            .get(job_type)
            .ok_or_else(|| CourierError::UnknownJobType(job_type.to_string()))?;
        self.queues.get(spec.queue.as_str()).ok_or_else(|| {
            CourierError::Config(format!(
                "job type {job_type} routes to missing queue {}",
                spec.queue
            ))
        })
    }

    pub fn queue(&self, queue: &str) -> Option<&QueueSpec> {
        self.queues.get(queue)
    }

    pub fn priority(&self, queue: &str) -> Option<i32> {
        self.queue(queue).map(QueueSpec::priority)
    }

    pub fn concurrency(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(QueueSpec::concurrency)
    }

    pub fn poll_interval(&self, queue: &str) -> Option<Duration> {
        self.queue(queue).map(QueueSpec::poll_interval)
    }

    pub fn global_semaphore_capacity(&self, queue: &str) -> Option<usize> {
        self.queue(queue)
            .and_then(QueueSpec::global_semaphore_capacity)
    }

    pub fn job_type(&self, job_type: &str) -> Option<&JobTypeSpec> {
        self.job_types.get(job_type)
    }

    pub fn timeout_for(&self, job_type: &str) -> Option<Duration> {
        self.job_type(job_type).map(JobTypeSpec::timeout)
    }

    /// Queues in priority order.
    pub fn queues(&self) -> impl Iterator<Item = &QueueSpec> {
        self.order.iter().filter_map(|name| self.queues.get(name))
    }

    pub fn job_types(&self) -> impl Iterator<Item = &JobTypeSpec> {
        self.job_types.values()
    }

    /// Capacity of the process-wide permit pool, if any queue declares one.
    pub fn global_capacity(&self) -> Option<usize> {
        self.global_capacity
    }

    /// Queues with no job type routed to them. Not an error, but usually a
    /// typo worth logging.
    pub fn idle_queues(&self) -> Vec<&QueueName> {
        let used: HashSet<&str> = self
            .job_types
            .values()
            .map(|spec| spec.queue.as_str())
            .collect();
        self.order
            .iter()
            .filter(|name| !used.contains(name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::config::{JobTypeConfig, QueueConfig};

    fn queue(name: &str, priority: i32, global: Option<usize>) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            priority,
            concurrency: 4,
            poll_interval_ms: 500,
            global_semaphore_capacity: global,
            ..QueueConfig::default()
        }
    }

    fn job(name: &str, queue: &str) -> JobTypeConfig {
        JobTypeConfig {
            name: name.to_string(),
            queue: queue.to_string(),
            timeout_ms: Some(60_000),
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            queues: vec![
                queue("feeds", 20, None),
                queue("screenshots", 10, Some(3)),
                queue("mail", 5, None),
            ],
            job_types: vec![
                job("RSS_FEED_REFRESH", "feeds"),
                job("SCREENSHOT_CAPTURE", "screenshots"),
                job("PAYMENT_RECEIPT_EMAIL", "mail"),
            ],
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn resolves_routing_and_limits() {
        let catalog = QueueCatalog::from_config(&config()).expect("valid catalog");

        let spec = catalog.queue_for("SCREENSHOT_CAPTURE").expect("routed");
        assert_eq!(spec.name().as_str(), "screenshots");
        assert_eq!(catalog.global_semaphore_capacity("screenshots"), Some(3));
        assert_eq!(catalog.global_semaphore_capacity("feeds"), None);
        assert_eq!(catalog.global_capacity(), Some(3));
        assert_eq!(catalog.concurrency("feeds"), Some(4));
        assert_eq!(catalog.poll_interval("mail"), Some(Duration::from_millis(500)));
        assert_eq!(
            catalog.timeout_for("RSS_FEED_REFRESH"),
            Some(Duration::from_secs(60))
        );

        let order: Vec<_> = catalog.queues().map(|q| q.name().as_str()).collect();
        assert_eq!(order, vec!["mail", "screenshots", "feeds"]);
    }

    #[test]
    fn unknown_job_type_is_a_configuration_error() {
        let catalog = QueueCatalog::from_config(&config()).expect("valid catalog");
        let err = catalog.queue_for("AI_TAGGING").expect_err("unknown type");
        assert!(matches!(err, CourierError::UnknownJobType(ref t) if t == "AI_TAGGING"));
        assert!(err.is_configuration());
    }

    #[test]
    fn job_type_on_missing_queue_fails_fast() {
        let mut cfg = config();
        cfg.job_types.push(job("AI_TAGGING", "ai"));
        let err = QueueCatalog::from_config(&cfg).expect_err("missing queue");
        assert!(err.to_string().contains("AI_TAGGING is mapped to unknown queue 'ai'"));
    }

    #[test]
    fn rejects_disagreeing_global_capacities_and_zero_concurrency() {
        let mut cfg = config();
        cfg.queues.push(queue("pdf", 30, Some(5)));
        cfg.queues[0].concurrency = 0;
        let message = QueueCatalog::from_config(&cfg)
            .expect_err("invalid")
            .to_string();
        assert!(message.contains("disagrees"), "{message}");
        assert!(message.contains("concurrency must be at least 1"), "{message}");
    }

    #[test]
    fn stale_threshold_must_outlast_timeouts() {
        let mut cfg = config();
        cfg.recovery.stale_after_ms = 60_000;
        let err = QueueCatalog::from_config(&cfg).expect_err("too short");
        assert!(err.to_string().contains("stale_after_ms"));
    }

    #[test]
    fn queue_overrides_apply_to_retry_policy() {
        let mut cfg = config();
        cfg.queues[2].max_attempts = Some(8);
        cfg.queues[2].backoff_base_ms = Some(1_000);
        let catalog = QueueCatalog::from_config(&cfg).expect("valid");

        let mail = catalog.queue("mail").expect("mail");
        assert_eq!(mail.retry().max_attempts(), 8);
        assert_eq!(mail.retry().base(), Duration::from_secs(1));

        let feeds = catalog.queue("feeds").expect("feeds");
        assert_eq!(feeds.retry().max_attempts(), 5);
        assert_eq!(feeds.retry().base(), Duration::from_secs(30));
    }

    #[test]
    fn reports_queues_without_job_types() {
        let mut cfg = config();
        cfg.queues.push(queue("unused", 50, None));
        let catalog = QueueCatalog::from_config(&cfg).expect("valid");
        let idle: Vec<_> = catalog.idle_queues().into_iter().map(|q| q.as_str()).collect();
        assert_eq!(idle, vec!["unused"]);
    }
}
