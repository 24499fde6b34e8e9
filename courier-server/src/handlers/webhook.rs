use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use courier_core::jobs::{HandlerResult, JobContext, JobHandler};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::debug;
use url::Url;

use super::http_check::{classify_status, classify_transport};

pub const JOB_ID_HEADER: &str = "x-courier-job-id";
pub const ATTEMPT_HEADER: &str = "x-courier-attempt";

/// POST the job payload to a fixed endpoint (mail relays, chat hooks).
///
/// Receivers can deduplicate on the job id header: a retried attempt
/// resends the same id.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    client: Client,
    url: Url,
    headers: HeaderMap,
}

impl WebhookHandler {
    pub fn new(
        client: Client,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid webhook url {url}"))?;
        Ok(Self {
            client,
            url,
            headers: header_map(headers)?,
        })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| anyhow!("invalid header name {name:?}: {err}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| anyhow!("invalid value for header {name}: {err}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(JOB_ID_HEADER, ctx.job_id().to_string())
            .header(ATTEMPT_HEADER, ctx.attempt().to_string())
            .json(ctx.payload())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        debug!(
            job_id = %ctx.job_id(),
            url = %self.url,
            status = status.as_u16(),
            "webhook delivered"
        );
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_configured_headers() {
        let headers = BTreeMap::from([
            ("Authorization".to_string(), "Bearer relay-token".to_string()),
            ("x-tenant".to_string(), "newsroom".to_string()),
        ]);
        let handler = WebhookHandler::new(Client::new(), "https://relay.example.com/send", &headers)
            .expect("handler");
        assert_eq!(handler.headers.len(), 2);
        assert_eq!(
            handler.headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer relay-token")
        );
    }

    #[test]
    fn rejects_invalid_header_names() {
        let headers = BTreeMap::from([("bad header".to_string(), "x".to_string())]);
        assert!(WebhookHandler::new(Client::new(), "https://relay.example.com", &headers).is_err());
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(WebhookHandler::new(Client::new(), "relay", &BTreeMap::new()).is_err());
    }
}
