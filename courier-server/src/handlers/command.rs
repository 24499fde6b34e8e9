use std::{collections::BTreeMap, io, process::Stdio};

use async_trait::async_trait;
use courier_core::jobs::{HandlerResult, JobContext, JobFailure, JobHandler};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL: usize = 512;

/// Run an external program per job, e.g. a headless browser capturing a
/// screenshot. The child is killed if the execution is dropped (timeout or
/// shutdown).
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandHandler {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            env,
        }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        let args = self
            .args
            .iter()
            .map(|arg| render(arg, ctx.payload()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .envs(&self.env)
            .env("COURIER_JOB_ID", ctx.job_id().to_string())
            .env("COURIER_JOB_TYPE", ctx.job_type().as_str())
            .env("COURIER_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            output = command.output() => output.map_err(|err| spawn_failure(&self.program, err))?,
            _ = ctx.cancellation().cancelled() => {
                return Err(JobFailure::retryable(format!("{} stopped by shutdown", self.program)));
            }
        };

        if output.status.success() {
            debug!(job_id = %ctx.job_id(), program = %self.program, "command succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail(stderr.trim(), STDERR_TAIL);
        Err(JobFailure::retryable(format!(
            "{} exited with {}: {}",
            self.program, output.status, tail
        )))
    }
}

fn spawn_failure(program: &str, err: io::Error) -> JobFailure {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            JobFailure::terminal(format!("cannot run {program}: {err}"))
        }
        _ => JobFailure::retryable(format!("failed to run {program}: {err}")),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Replace `{field}` placeholders with top-level payload values. Strings are
/// inserted verbatim, other values as JSON.
pub(crate) fn render(template: &str, payload: &Value) -> Result<String, JobFailure> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            JobFailure::terminal(format!("unterminated placeholder in {template:?}"))
        })?;
        let field = &after[..close];
        match payload.get(field) {
            Some(Value::String(value)) => out.push_str(value),
            Some(Value::Null) | None => {
                return Err(JobFailure::terminal(format!(
                    "payload has no value for placeholder {{{field}}}"
                )));
            }
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::jobs::{JobRecord, JobType, NewJob, QueueName};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn context(payload: Value) -> JobContext {
        let job = NewJob::new(
            JobType::new("SCREENSHOT_CAPTURE"),
            QueueName::new("screenshots"),
            payload,
            Utc::now(),
        );
        let mut record = JobRecord::from_new(job, Utc::now());
        record.attempt = 1;
        JobContext::new(&record, CancellationToken::new())
    }

    #[test]
    fn renders_placeholders() {
        let payload = json!({ "url": "https://example.com", "width": 1280 });
        assert_eq!(
            render("--window-size={width} {url}", &payload).expect("render"),
            "--window-size=1280 https://example.com"
        );
        assert_eq!(render("--headless", &payload).expect("plain"), "--headless");
    }

    #[test]
    fn missing_field_is_terminal() {
        let failure = render("{url}", &json!({})).expect_err("missing");
        assert!(!failure.retryable);
        let failure = render("{url", &json!({ "url": "x" })).expect_err("unterminated");
        assert!(!failure.retryable);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("ééé", 3), "é");
    }

    #[tokio::test]
    async fn exit_status_decides_outcome() {
        let ok = CommandHandler::new("sh", vec!["-c".into(), "exit 0".into()], BTreeMap::new());
        assert!(ok.execute(&context(json!({}))).await.is_ok());

        let failing = CommandHandler::new(
            "sh",
            vec!["-c".into(), "echo capture failed for {url} >&2; exit 3".into()],
            BTreeMap::new(),
        );
        let failure = failing
            .execute(&context(json!({ "url": "https://example.com" })))
            .await
            .expect_err("non-zero exit");
        assert!(failure.retryable);
        assert!(failure.message.contains("capture failed for https://example.com"));
    }

    #[tokio::test]
    async fn missing_program_is_terminal() {
        let handler = CommandHandler::new("courier-no-such-program", Vec::new(), BTreeMap::new());
        let failure = handler.execute(&context(json!({}))).await.expect_err("missing");
        assert!(!failure.retryable);
    }
}
