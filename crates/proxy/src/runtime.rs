//! The serverless-host event loop and envelope dispatch.
//!
//! Events are fetched from the runtime API as raw JSON and discriminated by
//! key: `Records` means a queue batch, `rawQueryString` an HTTP gateway
//! request, `cron` a schedule tick. The loop registers itself before the
//! user program is ready so the host queues invocations instead of timing
//! them out; dispatch blocks on the readiness gate.

use std::io::Write;
use std::sync::Arc;

use anyhow::bail;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{cron, http, sqs};

/// Everything a handler needs to reach the user program.
pub struct Context {
    pub client: reqwest::Client,
    pub app_endpoint: String,
}

/// Routes one raw event envelope to its handler and returns the payload to
/// report back to the host.
pub async fn dispatch(ctx: &Context, raw: &[u8]) -> anyhow::Result<Value> {
    let envelope: Value = serde_json::from_slice(raw)?;

    if envelope.get("Records").is_some() {
        let event: sqs::QueueEvent = serde_json::from_value(envelope)?;
        let response = sqs::handle_queue_batch(&ctx.client, &ctx.app_endpoint, event).await;
        return Ok(serde_json::to_value(response)?);
    }

    if envelope.get("rawQueryString").is_some() {
        let event: http::HttpRequestEvent = serde_json::from_value(envelope)?;
        let response = http::handle_http(&ctx.client, &ctx.app_endpoint, event).await?;
        return Ok(serde_json::to_value(response)?);
    }

    if let Some(name) = envelope.get("cron").and_then(Value::as_str) {
        cron::handle_cron(&ctx.client, &ctx.app_endpoint, name).await?;
        return Ok(Value::Null);
    }

    bail!("event type not supported by this function: {envelope}");
}

/// Long-poll loop against the host's runtime API. Runs for the life of the
/// container; errors are reported per-invocation, never panicked.
pub async fn run_event_loop(ctx: Arc<Context>, mut ready: watch::Receiver<bool>) {
    let Ok(api) = std::env::var("AWS_LAMBDA_RUNTIME_API") else {
        error!("AWS_LAMBDA_RUNTIME_API is not set");
        return;
    };
    let base = format!("http://{api}/2018-06-01/runtime");
    let client = reqwest::Client::new();

    loop {
        let next = match client.get(format!("{base}/invocation/next")).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("failed to fetch next invocation: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let request_id = next
            .headers()
            .get("Lambda-Runtime-Aws-Request-Id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let raw = match next.bytes().await {
            Ok(b) => b,
            Err(e) => {
                error!("failed to read invocation body: {e}");
                continue;
            }
        };
        if request_id.is_empty() {
            continue;
        }

        // Hold the event until the user program answers its first probe.
        if ready.wait_for(|r| *r).await.is_err() {
            return;
        }

        let result = dispatch(&ctx, &raw).await;

        // Flush before reporting so the host captures the handler's output.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        let report = match result {
            Ok(payload) => {
                debug!("invocation {request_id} succeeded");
                client
                    .post(format!("{base}/invocation/{request_id}/response"))
                    .json(&payload)
                    .send()
                    .await
            }
            Err(e) => {
                error!("invocation {request_id} failed: {e:#}");
                client
                    .post(format!("{base}/invocation/{request_id}/error"))
                    .json(&serde_json::json!({
                        "errorMessage": e.to_string(),
                        "errorType": "HandlerError",
                    }))
                    .send()
                    .await
            }
        };
        if let Err(e) = report {
            error!("failed to report invocation {request_id}: {e}");
        }
    }
}
