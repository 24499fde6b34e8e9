use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use url::Url;

fn default_url_field() -> String {
    "url".to_string()
}

/// Built-in handler a job type is bound to.
///
/// ```toml
/// [handlers.LINK_HEALTH_CHECK]
/// kind = "http_check"
///
/// [handlers.PAYMENT_RECEIPT_EMAIL]
/// kind = "webhook"
/// url = "https://relay.internal/send"
///
/// [handlers.SCREENSHOT_CAPTURE]
/// kind = "command"
/// program = "chromium"
/// args = ["--headless", "--screenshot={out}", "{url}"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerBinding {
    /// GET the URL found in the payload and classify the response status.
    HttpCheck {
        /// Payload field holding the URL to check.
        #[serde(default = "default_url_field")]
        url_field: String,
    },
    /// POST the payload as JSON to a fixed endpoint.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Run a program. `{field}` placeholders in `args` are filled from
    /// top-level payload fields.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Log the job and succeed.
    Log,
}

impl HandlerBinding {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerBinding::HttpCheck { .. } => "http_check",
            HandlerBinding::Webhook { .. } => "webhook",
            HandlerBinding::Command { .. } => "command",
            HandlerBinding::Log => "log",
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            HandlerBinding::HttpCheck { url_field } => {
                if url_field.trim().is_empty() {
                    bail!("url_field must not be empty");
                }
            }
            HandlerBinding::Webhook { url, .. } => {
                let parsed =
                    Url::parse(url).map_err(|err| anyhow!("invalid webhook url {url}: {err}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    bail!("webhook url must be http or https, got {}", parsed.scheme());
                }
            }
            HandlerBinding::Command { program, args, .. } => {
                if program.trim().is_empty() {
                    bail!("program must not be empty");
                }
                for arg in args {
                    if arg.matches('{').count() != arg.matches('}').count() {
                        bail!("unbalanced placeholder in argument {arg:?}");
                    }
                }
            }
            HandlerBinding::Log => {}
        }
        Ok(())
    }
}
