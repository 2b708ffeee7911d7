//! Queue bridging: inbound batch events become per-record POSTs to the user
//! program, and the loopback side-channel lets the program publish queue
//! messages without carrying a cloud SDK.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const GROUP_ID_HEADER: &str = "Lambdafy-SQS-Group-Id";
pub const BATCH_MESSAGE_HEADER: &str = "Lambdafy-SQS-Batch-Message";

/// The provider caps batch sends at ten messages per call.
pub const MAX_SEND_BATCH: usize = 10;

const MAX_SEND_ATTEMPTS: usize = 5;

#[derive(Debug, Deserialize)]
pub struct QueueEvent {
    #[serde(default, rename = "Records")]
    pub records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
pub struct QueueRecord {
    #[serde(default, rename = "messageId")]
    pub message_id: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Serialize)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

/// Delivers every record of a batch to the app concurrently. A response in
/// `[200,400)` settles the record; everything else lands in
/// `batchItemFailures` so the host retries only those messages.
pub async fn handle_queue_batch(
    client: &reqwest::Client,
    app_endpoint: &str,
    event: QueueEvent,
) -> QueueResponse {
    info!("processing batch of {} queue records", event.records.len());

    let url = format!("http://{app_endpoint}/_lambdafy/sqs");
    let deliveries = event.records.into_iter().map(|record| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let result = async {
                let resp = client
                    .post(&url)
                    .body(record.body.clone())
                    .send()
                    .await
                    .map_err(|e| format!("error sending HTTP request: {e}"))?;
                let status = resp.status().as_u16();
                if (200..400).contains(&status) {
                    return Ok(());
                }
                let body = resp.text().await.unwrap_or_default();
                Err(format!("non-2xx/3xx response ({status}): {body}"))
            }
            .await;
            (record.message_id, result)
        }
    });

    let mut response = QueueResponse::default();
    for (message_id, result) in futures::future::join_all(deliveries).await {
        if let Err(reason) = result {
            error!("failed to process queue msg {message_id}: {reason}");
            response.batch_item_failures.push(BatchItemFailure {
                item_identifier: message_id,
            });
        }
    }
    if !response.batch_item_failures.is_empty() {
        error!(
            "{} queue records failed in this batch",
            response.batch_item_failures.len()
        );
    }
    response
}

/// State of the loopback side-channel: the send-queue map is written once
/// during setup and read-only afterwards.
pub struct SideChannel {
    pub send_queues: HashMap<String, String>,
    pub sqs: aws_sdk_sqs::Client,
}

pub fn side_channel_router(state: Arc<SideChannel>) -> Router {
    // Only POST is routed; axum answers other methods with 405.
    Router::new().route("/sqs", post(handle_send)).with_state(state)
}

/// Splits a `Content-Type` header into its media type.
fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

/// Validates and parses a batch-send request body: a JSON array of message
/// strings with `Content-Type: application/json`.
pub fn parse_batch_body(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Vec<String>, (StatusCode, String)> {
    let content_type = content_type.unwrap_or_default();
    if media_type(content_type) != "application/json" {
        return Err((
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json for batch messages".to_string(),
        ));
    }
    let messages: Vec<String> = serde_json::from_slice(body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON array".to_string()))?;
    if messages.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty message array".to_string()));
    }
    Ok(messages)
}

async fn handle_send(
    State(state): State<Arc<SideChannel>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing queue ID".to_string());
    };
    let Some(queue_url) = state.send_queues.get(id) else {
        return (StatusCode::BAD_REQUEST, "Invalid queue ID".to_string());
    };

    let group_id = headers
        .get(GROUP_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if headers.get(BATCH_MESSAGE_HEADER).is_none() {
        // Single message.
        let message = String::from_utf8_lossy(&body).into_owned();
        if let Err(e) = state
            .sqs
            .send_message()
            .queue_url(queue_url)
            .message_body(message)
            .set_message_group_id(group_id)
            .send()
            .await
        {
            error!("error sending queue message: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error sending queue message: {e}"),
            );
        }
        info!("sent a queue message to '{queue_url}'");
        return (StatusCode::OK, String::new());
    }

    // Batch send.
    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok());
    let messages = match parse_batch_body(content_type, &body) {
        Ok(m) => m,
        Err((status, msg)) => return (status, msg),
    };
    let total = messages.len();

    match send_batches(&state.sqs, queue_url, messages, group_id).await {
        Ok(()) => {
            info!("sent {total} queue messages to '{queue_url}'");
            (StatusCode::OK, String::new())
        }
        Err(reason) => {
            error!("batch send to '{queue_url}' failed: {reason}");
            (StatusCode::INTERNAL_SERVER_ERROR, reason)
        }
    }
}

/// Sends messages in chunks of [`MAX_SEND_BATCH`], retrying entries that
/// failed for non-sender reasons up to five rounds per chunk.
async fn send_batches(
    sqs: &aws_sdk_sqs::Client,
    queue_url: &str,
    messages: Vec<String>,
    group_id: Option<String>,
) -> Result<(), String> {
    for chunk in messages.chunks(MAX_SEND_BATCH) {
        let entries = chunk
            .iter()
            .enumerate()
            .map(|(i, message)| {
                SendMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .message_body(message)
                    .set_message_group_id(group_id.clone())
                    .build()
                    .map_err(|e| format!("failed to build batch entry: {e}"))
            })
            .collect::<Result<Vec<_>, String>>()?;

        let mut pending = entries;
        let mut sender_faults = 0usize;
        let mut attempts = 0usize;
        while !pending.is_empty() && attempts < MAX_SEND_ATTEMPTS {
            attempts += 1;
            let out = sqs
                .send_message_batch()
                .queue_url(queue_url)
                .set_entries(Some(pending.clone()))
                .send()
                .await
                .map_err(|e| format!("error sending queue message batch: {e}"))?;

            let by_id: HashMap<&str, &SendMessageBatchRequestEntry> =
                pending.iter().map(|e| (e.id(), e)).collect();
            let mut retry = Vec::new();
            for failed in out.failed() {
                if failed.sender_fault() {
                    sender_faults += 1;
                } else if let Some(entry) = by_id.get(failed.id()) {
                    retry.push((*entry).clone());
                }
            }
            pending = retry;
        }

        if sender_faults > 0 || !pending.is_empty() {
            return Err(format!(
                "{} of {} queue messages in batch failed",
                sender_faults + pending.len(),
                chunk.len()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_chunking_is_ten_ten_three() {
        let messages: Vec<String> = (0..23).map(|i| format!("m{i}")).collect();
        let sizes: Vec<usize> = messages.chunks(MAX_SEND_BATCH).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn batch_body_requires_json_media_type() {
        assert!(parse_batch_body(Some("application/json"), b"[\"a\"]").is_ok());
        assert!(parse_batch_body(Some("application/json; charset=utf-8"), b"[\"a\"]").is_ok());
        assert!(parse_batch_body(Some("text/plain"), b"[\"a\"]").is_err());
        assert!(parse_batch_body(None, b"[\"a\"]").is_err());
    }

    #[test]
    fn batch_body_must_be_nonempty_string_array() {
        assert!(parse_batch_body(Some("application/json"), b"[]").is_err());
        assert!(parse_batch_body(Some("application/json"), b"{\"a\":1}").is_err());
        let parsed = parse_batch_body(Some("application/json"), b"[\"a\",\"b\"]").unwrap();
        assert_eq!(parsed, vec!["a".to_string(), "b".to_string()]);
    }
}
