use std::{collections::HashMap, fmt, sync::Arc};

use super::{
    catalog::QueueCatalog,
    handler::JobHandler,
    job::JobType,
};
use crate::error::{CourierError, Result};

/// Job type to handler lookup. Populated once at start-up and shared
/// read-only by every dispatcher.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(JobType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("job_types", &types)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`. Registering the same type twice is
    /// a configuration error.
    pub fn register<H>(&mut self, job_type: impl Into<JobType>, handler: H) -> Result<()>
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(CourierError::Config(format!(
                "handler for {job_type} registered twice"
            )));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Builder-style variant of [`HandlerRegistry::register`].
    pub fn with<H>(mut self, job_type: impl Into<JobType>, handler: H) -> Result<Self>
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Cross-check against the catalog: every routed job type needs a handler
    /// and every handler needs a route.
    pub fn validate_against(&self, catalog: &QueueCatalog) -> Result<()> {
        let mut problems = Vec::new();

        let mut missing: Vec<_> = catalog
            .job_types()
            .map(|spec| spec.job_type().as_str())
            .filter(|job_type| !self.contains(job_type))
            .collect();
        missing.sort_unstable();
        if !missing.is_empty() {
            problems.push(format!("no handler registered for {}", missing.join(", ")));
        }

        let mut unrouted: Vec<_> = self
            .handlers
            .keys()
            .map(JobType::as_str)
            .filter(|job_type| catalog.job_type(job_type).is_none())
            .collect();
        unrouted.sort_unstable();
        if !unrouted.is_empty() {
            problems.push(format!(
                "handlers registered for job types missing from the catalog: {}",
                unrouted.join(", ")
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CourierError::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        config::{DispatchConfig, JobTypeConfig, QueueConfig},
        handler::{JobContext, handler_fn},
    };

    fn catalog() -> QueueCatalog {
        let config = DispatchConfig {
            queues: vec![QueueConfig {
                name: "feeds".into(),
                ..QueueConfig::default()
            }],
            job_types: vec![
                JobTypeConfig {
                    name: "RSS_FEED_REFRESH".into(),
                    queue: "feeds".into(),
                    timeout_ms: None,
                },
                JobTypeConfig {
                    name: "ATOM_FEED_REFRESH".into(),
                    queue: "feeds".into(),
                    timeout_ms: None,
                },
            ],
            ..DispatchConfig::default()
        };
        QueueCatalog::from_config(&config).expect("catalog")
    }

    fn ok_handler() -> impl JobHandler {
        handler_fn(|_ctx: JobContext| async { Ok(()) })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("RSS_FEED_REFRESH", ok_handler()).expect("first");
        let err = registry
            .register("RSS_FEED_REFRESH", ok_handler())
            .expect_err("second");
        assert!(err.is_configuration());
    }

    #[test]
    fn validation_reports_both_directions() {
        let registry = HandlerRegistry::new()
            .with("RSS_FEED_REFRESH", ok_handler())
            .and_then(|r| r.with("AI_TAGGING", ok_handler()))
            .expect("registry");

        let message = registry
            .validate_against(&catalog())
            .expect_err("mismatch")
            .to_string();
        assert!(message.contains("no handler registered for ATOM_FEED_REFRESH"));
        assert!(message.contains("missing from the catalog: AI_TAGGING"));
    }

    #[test]
    fn complete_registry_validates() {
        let registry = HandlerRegistry::new()
            .with("RSS_FEED_REFRESH", ok_handler())
            .and_then(|r| r.with("ATOM_FEED_REFRESH", ok_handler()))
            .expect("registry");
        registry.validate_against(&catalog()).expect("valid");
        assert!(registry.get("RSS_FEED_REFRESH").is_some());
        assert!(registry.get("UNKNOWN").is_none());
    }
}
