use provider::{Provider, QueueTriggerConfig};
use serde::Serialize;
use tracing::info;

use crate::error::{ControllerError, Result};

/// A queue trigger of a function as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct QueueTriggerSummary {
    #[serde(skip)]
    pub uuid: String,
    pub arn: String,
    #[serde(rename = "batchSize")]
    pub batch_size: Option<i32>,
}

/// Lists the function's queue triggers, sorted by source ARN.
pub async fn sqs_list(provider: &dyn Provider, name: &str) -> Result<Vec<QueueTriggerSummary>> {
    let mut out: Vec<QueueTriggerSummary> = provider
        .list_queue_bindings(name)
        .await?
        .into_iter()
        .map(|b| QueueTriggerSummary {
            uuid: b.uuid,
            arn: b.source_arn,
            batch_size: b.batch_size,
        })
        .collect();
    out.sort_by(|a, b| a.arn.cmp(&b.arn));
    Ok(out)
}

/// Adds a queue trigger, or updates the batch size of the one already bound
/// to the queue. A function may have at most one binding per queue.
pub async fn sqs_add(provider: &dyn Provider, name: &str, arn: &str, batch_size: i32) -> Result<()> {
    let existing: Vec<_> = sqs_list(provider, name)
        .await?
        .into_iter()
        .filter(|t| t.arn == arn)
        .collect();
    if existing.len() > 1 {
        return Err(ControllerError::Other(anyhow::anyhow!(
            "found multiple event source mappings for function {name} and arn {arn} - must have zero or exactly one"
        )));
    }

    if let Some(t) = existing.first() {
        info!("updating existing trigger for '{arn}'");
        provider
            .update_queue_binding_batch_size(&t.uuid, batch_size)
            .await?;
    } else {
        info!("creating trigger for '{arn}'");
        provider
            .create_queue_binding(
                name,
                &QueueTriggerConfig {
                    source_arn: arn.to_string(),
                    batch_size: Some(batch_size),
                    ..Default::default()
                },
                true,
            )
            .await?;
    }
    Ok(())
}

/// Removes the triggers bound to `arn`, or every trigger when `arn` is
/// `None`.
pub async fn sqs_remove(provider: &dyn Provider, name: &str, arn: Option<&str>) -> Result<()> {
    for t in sqs_list(provider, name).await? {
        if arn.is_some_and(|a| a != t.arn) {
            continue;
        }
        provider.delete_queue_binding(&t.uuid).await?;
    }
    Ok(())
}
