//! Environment variable dereferencing.
//!
//! Values of the form `*type:payload` are resolved at startup, before the
//! user program is launched: `*ssm:` fetches a parameter, `*s3:bucket/key`
//! fetches an object, and `*lambdafy_sqs_send:{arn}` mints a loopback URL
//! the program can POST queue messages to. A leading `**` escapes a literal
//! `*`. Internal `LAMBDAFY_`-prefixed variables are stripped first so the
//! user program never observes them.

use std::collections::HashMap;

use anyhow::{Context as _, bail};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;

/// Env vars with this prefix are internal and removed before user code runs.
pub const INTERNAL_ENV_PREFIX: &str = "LAMBDAFY_";

pub const SQS_SEND_TAG: &str = "lambdafy_sqs_send";

static SQS_ARN_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^arn:aws:sqs:([^:]+):([^:]+):(.+)$").unwrap());

/// Queue URL for an SQS ARN, or `None` when the ARN is not an SQS one.
pub fn queue_url_from_arn(arn: &str) -> Option<String> {
    let caps = SQS_ARN_PAT.captures(arn)?;
    Some(format!(
        "https://sqs.{}.amazonaws.com/{}/{}",
        &caps[1], &caps[2], &caps[3]
    ))
}

fn random_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Strips internal variables, then dereferences every `*`-prefixed value in
/// the process environment. Returns the id -> queue-URL map minted for
/// `lambdafy_sqs_send` values; it is immutable from here on.
pub async fn process_env(side_port: u16) -> anyhow::Result<HashMap<String, String>> {
    for (key, _) in std::env::vars() {
        if key.starts_with(INTERNAL_ENV_PREFIX) {
            // SAFETY: called from the single-threaded startup path, before
            // the child or any worker threads observe the environment.
            unsafe { std::env::remove_var(&key) };
        }
    }

    let mut send_queues = HashMap::new();
    let mut aws_config = None;

    for (key, value) in std::env::vars() {
        let Some(rest) = value.strip_prefix('*') else {
            continue;
        };

        // "**..." is an escaped literal "*...".
        if let Some(literal) = rest.strip_prefix('*') {
            let new_value = format!("*{literal}");
            unsafe { std::env::set_var(&key, new_value) };
            continue;
        }

        let Some((tag, payload)) = rest.split_once(':') else {
            bail!("env var {key} has malformed deref value");
        };

        let new_value = match tag {
            "ssm" => {
                let config = ambient_config(&mut aws_config).await;
                let ssm = aws_sdk_ssm::Client::new(config);
                let out = ssm
                    .get_parameter()
                    .name(payload)
                    .with_decryption(true)
                    .send()
                    .await
                    .with_context(|| format!("failed to fetch SSM parameter for {key}"))?;
                out.parameter()
                    .and_then(|p| p.value())
                    .map(str::to_string)
                    .with_context(|| format!("SSM parameter for {key} has no value"))?
            }
            "s3" => {
                let (bucket, object_key) = payload
                    .split_once('/')
                    .with_context(|| format!("env var {key} must use *s3:bucket/key"))?;
                let config = ambient_config(&mut aws_config).await;
                let s3 = aws_sdk_s3::Client::new(config);
                let out = s3
                    .get_object()
                    .bucket(bucket)
                    .key(object_key)
                    .send()
                    .await
                    .with_context(|| format!("failed to fetch S3 object for {key}"))?;
                let bytes = out
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("failed to read S3 object for {key}"))?
                    .into_bytes();
                String::from_utf8(bytes.to_vec())
                    .with_context(|| format!("S3 object for {key} is not UTF-8"))?
            }
            SQS_SEND_TAG => {
                let queue_url = queue_url_from_arn(payload)
                    .with_context(|| format!("invalid SQS ARN in env var {key}"))?;
                // Random ids keep the user program from relying on the URL
                // staying stable across cold starts.
                let id = random_id();
                let url = format!("http://127.0.0.1:{side_port}/sqs?id={id}");
                send_queues.insert(id, queue_url);
                url
            }
            other => bail!("env var {key} uses unknown deref type '{other}'"),
        };

        unsafe { std::env::set_var(&key, new_value) };
    }

    Ok(send_queues)
}

async fn ambient_config(cache: &mut Option<aws_config::SdkConfig>) -> &aws_config::SdkConfig {
    if cache.is_none() {
        *cache = Some(aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await);
    }
    cache.as_ref().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_url_from_arn_parses_sqs_arns() {
        assert_eq!(
            queue_url_from_arn("arn:aws:sqs:us-west-2:1:q").as_deref(),
            Some("https://sqs.us-west-2.amazonaws.com/1/q")
        );
        assert_eq!(queue_url_from_arn("arn:aws:sns:us-west-2:1:t"), None);
    }

    #[tokio::test]
    async fn internal_vars_are_stripped_and_send_urls_minted() {
        unsafe {
            std::env::set_var("LAMBDAFY__SPEC_CORS", "{}");
            std::env::set_var("ENVDEREF_TEST_PLAIN", "value");
            std::env::set_var("ENVDEREF_TEST_ESCAPED", "**not-a-deref");
            std::env::set_var(
                "ENVDEREF_TEST_QUEUE",
                "*lambdafy_sqs_send:arn:aws:sqs:us-west-2:1:q",
            );
        }

        let send_queues = process_env(19001).await.unwrap();

        assert!(std::env::var("LAMBDAFY__SPEC_CORS").is_err());
        assert_eq!(std::env::var("ENVDEREF_TEST_PLAIN").unwrap(), "value");
        assert_eq!(
            std::env::var("ENVDEREF_TEST_ESCAPED").unwrap(),
            "*not-a-deref"
        );

        let url = std::env::var("ENVDEREF_TEST_QUEUE").unwrap();
        assert!(url.starts_with("http://127.0.0.1:19001/sqs?id="));
        let id = url.rsplit_once('=').unwrap().1;
        assert_eq!(
            send_queues.get(id).map(String::as_str),
            Some("https://sqs.us-west-2.amazonaws.com/1/q")
        );
    }
}
