use async_trait::async_trait;
use courier_core::jobs::{HandlerResult, JobContext, JobFailure, JobHandler};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Link health check: GET the payload URL and judge the status code.
#[derive(Debug, Clone)]
pub struct HttpCheckHandler {
    client: Client,
    url_field: String,
}

impl HttpCheckHandler {
    pub fn new(client: Client, url_field: impl Into<String>) -> Self {
        Self {
            client,
            url_field: url_field.into(),
        }
    }
}

#[async_trait]
impl JobHandler for HttpCheckHandler {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        let url = target_url(ctx.payload(), &self.url_field)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        debug!(job_id = %ctx.job_id(), %url, status = status.as_u16(), "link checked");
        classify_status(status)
    }
}

/// Extract and parse an http(s) URL from a payload field.
pub(crate) fn target_url(payload: &Value, field: &str) -> Result<Url, JobFailure> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JobFailure::terminal(format!(
                "payload field '{field}' is missing or not a string"
            ))
        })?;
    let url = Url::parse(raw)
        .map_err(|err| JobFailure::terminal(format!("malformed url {raw:?}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(JobFailure::terminal(format!("unsupported url scheme {other}"))),
    }
}

/// 2xx and 3xx succeed. Timeouts, throttling and server errors are worth
/// retrying; any other client error will not change on retry.
pub(crate) fn classify_status(status: StatusCode) -> HandlerResult {
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }
    let message = format!("upstream responded {status}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(JobFailure::retryable(message))
    } else {
        Err(JobFailure::terminal(message))
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> JobFailure {
    if err.is_builder() {
        JobFailure::terminal(format!("invalid request: {err}"))
    } else {
        JobFailure::retryable(format!("request failed: {err}"))
    }
}
