//! Built-in handlers that configuration can bind job types to.

pub mod command;
pub mod http_check;
pub mod webhook;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use courier_config::HandlerBinding;
use courier_core::jobs::{HandlerRegistry, HandlerResult, JobContext, JobHandler};
use tracing::info;

pub use command::CommandHandler;
pub use http_check::HttpCheckHandler;
pub use webhook::WebhookHandler;

/// Logs the job and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        info!(
            job_id = %ctx.job_id(),
            job_type = %ctx.job_type(),
            queue = %ctx.queue(),
            attempt = ctx.attempt(),
            payload = %ctx.payload(),
            "log handler"
        );
        Ok(())
    }
}

/// Instantiate one handler per binding. HTTP handlers share a client.
pub fn build_registry(
    bindings: &BTreeMap<String, HandlerBinding>,
) -> anyhow::Result<HandlerRegistry> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let mut registry = HandlerRegistry::new();
    for (job_type, binding) in bindings {
        let handler: Arc<dyn JobHandler> = match binding {
            HandlerBinding::HttpCheck { url_field } => {
                Arc::new(HttpCheckHandler::new(client.clone(), url_field.clone()))
            }
            HandlerBinding::Webhook { url, headers } => Arc::new(
                WebhookHandler::new(client.clone(), url, headers)
                    .with_context(|| format!("handler for {job_type}"))?,
            ),
            HandlerBinding::Command { program, args, env } => {
                Arc::new(CommandHandler::new(program.clone(), args.clone(), env.clone()))
            }
            HandlerBinding::Log => Arc::new(LogHandler),
        };
        registry
            .register_arc(job_type.as_str(), handler)
            .with_context(|| format!("failed to register handler for {job_type}"))?;
        info!(job_type, kind = binding.kind(), "handler bound");
    }
    Ok(registry)
}
