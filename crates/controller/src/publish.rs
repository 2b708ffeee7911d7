use docker::{AdapterBinary, ImageManager, PROXY_PATH};
use fnspec::{ROLE_GENERATE, RolePolicy, Spec};
use once_cell::sync::Lazy;
use provider::{CorsConfig, FileSystemMount, FunctionConfig, Provider, QueueTriggerConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{
    DEFAULT_ASSUME_ROLE_POLICY, GENERATED_ROLE_PREFIX, PUBLISH_TIMEOUT, SPEC_ENV_CORS,
    SPEC_ENV_CRON_PREFIX,
};
use crate::error::{ControllerError, Result};
use crate::retry::{retry_on_conflict, wait_on_function};

static ROLE_ARN_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^arn:aws:iam::\d+:role/.+").unwrap());

/// Outcome of a publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub name: String,
    pub arn: String,
    pub version: i64,
}

/// Statements every generated role carries, before the spec's extras.
fn default_role_policy_statements() -> Vec<RolePolicy> {
    vec![RolePolicy {
        effect: "Allow".to_string(),
        action: [
            "ec2:AssignPrivateIpAddresses",
            "ec2:CreateNetworkInterface",
            "ec2:DeleteNetworkInterface",
            "ec2:DescribeNetworkInterfaces",
            "ec2:UnassignPrivateIpAddresses",
            "logs:CreateLogGroup",
            "logs:CreateLogStream",
            "logs:PutLogEvents",
            "sqs:DeleteMessage",
            "sqs:GetQueueAttributes",
            "sqs:ReceiveMessage",
            "sqs:SendMessage",
            // Needed for the scheduler to invoke the function.
            "lambda:InvokeFunction",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        resource: vec!["*".to_string()],
    }]
}

/// IAM policy document in the wire casing the provider expects.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Action")]
    pub action: Vec<String>,
    #[serde(rename = "Resource")]
    pub resource: Vec<String>,
}

impl From<&RolePolicy> for PolicyStatement {
    fn from(p: &RolePolicy) -> Self {
        PolicyStatement {
            effect: p.effect.clone(),
            action: p.action.clone(),
            resource: p.resource.clone(),
        }
    }
}

impl From<PolicyStatement> for RolePolicy {
    fn from(p: PolicyStatement) -> Self {
        RolePolicy {
            effect: p.effect,
            action: p.action,
            resource: p.resource,
        }
    }
}

/// Serializes default + extra statements into the provider's policy format.
pub(crate) fn serialize_role_policy(extra: &[RolePolicy]) -> Result<String> {
    let mut statements = default_role_policy_statements();
    statements.extend(extra.iter().cloned());
    let doc = PolicyDocument {
        version: "2012-10-17".to_string(),
        statement: statements.iter().map(PolicyStatement::from).collect(),
    };
    Ok(serde_json::to_string_pretty(&doc).map_err(anyhow::Error::from)?)
}

/// Round-trips a policy document through a JSON value so the same content
/// always hashes the same regardless of formatting.
pub(crate) fn canonicalize_policy(s: &str) -> Result<String> {
    let v: serde_json::Value = serde_json::from_str(s).map_err(anyhow::Error::from)?;
    Ok(serde_json::to_string(&v)
        .map_err(anyhow::Error::from)?
        .trim()
        .to_string())
}

/// Name of the generated role holding exactly this policy content.
pub(crate) fn generated_role_name(canonical_policy: &str) -> String {
    let digest = md5::compute(format!("{DEFAULT_ASSUME_ROLE_POLICY}{canonical_policy}"));
    format!("{GENERATED_ROLE_PREFIX}{digest:x}")
}

async fn resolve_role(provider: &dyn Provider, spec: &Spec) -> Result<String> {
    if ROLE_ARN_PAT.is_match(&spec.role) {
        return Ok(spec.role.clone());
    }

    if spec.role == ROLE_GENERATE {
        info!("generating role");
        let policy = serialize_role_policy(&spec.role_extra_policy)?;
        let canonical = canonicalize_policy(&policy)?;
        let role_name = generated_role_name(&canonical);

        let role_arn = match provider
            .create_role(
                &role_name,
                DEFAULT_ASSUME_ROLE_POLICY,
                "lambdafy generated role",
                &spec.tags,
            )
            .await
        {
            Ok(arn) => arn,
            Err(e) if e.is_already_exists() => provider.get_role_arn(&role_name).await?,
            Err(e) => return Err(e.into()),
        };

        // The role may predate a policy change that does not affect the
        // name; the inline policy is re-put unconditionally.
        provider.put_role_policy(&role_name, "main", &canonical).await?;

        return Ok(role_arn);
    }

    Ok(provider.get_role_arn(&spec.role).await?)
}

/// Publishes a new version of the function described by `spec` without
/// routing any traffic to it. `adapter` is required when the image needs
/// preparation (non-registry image reference).
pub async fn publish(
    provider: &dyn Provider,
    adapter: Option<&AdapterBinary>,
    mut spec: Spec,
) -> Result<PublishResult> {
    // Is this account/region allowed by the spec?

    let ident = provider.caller_identity().await?;
    if !spec.is_account_region_allowed(&ident.account, &ident.region) {
        return Err(ControllerError::NotAllowedHere);
    }

    // If a VPC is configured, the function is unreachable without egress:
    // refuse when there is none, and warn when logs cannot leave the VPC.

    if !spec.vpc_security_group_ids.is_empty() || !spec.vpc_subnet_ids.is_empty() {
        let rules = provider
            .security_group_egress(&spec.vpc_security_group_ids)
            .await?;
        if rules.is_empty() {
            return Err(ControllerError::NoEgress);
        }
        let all_egress = rules
            .iter()
            .any(|r| r.ip_protocol.as_deref() == Some("-1"));
        if !all_egress {
            warn!(
                "VPC config is set but no egress rule allows all traffic - logs will not reach telemetry"
            );
        }
    }

    if !spec.entrypoint.is_empty() && spec.entrypoint[0] != PROXY_PATH {
        info!("prefixing entrypoint with '{PROXY_PATH}'");
        spec.entrypoint.insert(0, PROXY_PATH.to_string());
    }

    if spec.needs_build_and_push() {
        let adapter = adapter.ok_or_else(|| {
            anyhow::anyhow!("an adapter binary is required to prepare image '{}'", spec.image)
        })?;
        info!("preparing image '{}' and pushing", spec.image);
        let images = ImageManager::new()?;
        images.prepare(&spec.image, adapter).await?;
        let repo_uri = provider
            .ensure_repository(&spec.repo_name, spec.create_repo.unwrap_or(false))
            .await?;
        let auth = provider.registry_auth().await?;
        spec.image = images.push(&spec.image, &repo_uri, &auth).await?;
    }

    // Deploy-time settings have nowhere durable to live except the function
    // configuration itself, so they ride along as environment hints that the
    // runtime adapter strips before user code runs.

    let cors = spec
        .cors
        .as_ref()
        .map(|c| CorsConfig {
            origins: c.origins.clone(),
            methods: c.methods.clone(),
            headers: c.headers.clone(),
        })
        .unwrap_or_default();
    spec.env.insert(
        SPEC_ENV_CORS.to_string(),
        serde_json::to_string(&cors).map_err(anyhow::Error::from)?,
    );
    for (name, expr) in &spec.cron {
        spec.env
            .insert(format!("{SPEC_ENV_CRON_PREFIX}{name}"), expr.clone());
    }

    let role_arn = resolve_role(provider, &spec).await?;

    let mut tags = spec.tags.clone();
    tags.insert("Name".to_string(), spec.name.clone());

    let config = FunctionConfig {
        name: spec.name.clone(),
        description: spec.description.clone(),
        role_arn,
        image_uri: spec.image.clone(),
        entrypoint: spec.entrypoint.clone(),
        command: spec.command.clone(),
        workdir: spec.workdir.clone(),
        memory: spec.memory,
        timeout: spec.timeout,
        temp_size: spec.temp_size,
        env: spec.env.clone(),
        subnet_ids: spec.vpc_subnet_ids.clone(),
        security_group_ids: spec.vpc_security_group_ids.clone(),
        efs_mounts: spec
            .efs_mounts
            .iter()
            .map(|m| FileSystemMount {
                arn: m.arn.clone(),
                path: m.path.clone(),
            })
            .collect(),
        tags: tags.clone(),
    };

    let published = match provider.get_function(&spec.name, None).await {
        Err(e) if e.is_not_found() => {
            info!("creating new function '{}'", spec.name);
            retry_on_conflict(PUBLISH_TIMEOUT, || provider.create_function(&config)).await?
        }
        Err(e) => return Err(e.into()),
        Ok(existing) => {
            info!("updating existing function '{}'", spec.name);
            retry_on_conflict(PUBLISH_TIMEOUT, || {
                provider.update_function_configuration(&config)
            })
            .await?;
            let published = retry_on_conflict(PUBLISH_TIMEOUT, || {
                provider.update_function_code(&spec.name, &spec.image)
            })
            .await?;

            provider.tag_function(&existing.arn, &tags).await?;
            let stale: Vec<String> = existing
                .tags
                .keys()
                .filter(|k| !tags.contains_key(*k))
                .cloned()
                .collect();
            if !stale.is_empty() {
                provider.untag_function(&existing.arn, &stale).await?;
            }
            published
        }
    };

    // Bindings are pinned to the fresh version and stay disabled until the
    // deploy cut-over enables them.

    let function_ref = format!("{}:{}", spec.name, published.version);
    for t in &spec.sqs_triggers {
        let trigger = QueueTriggerConfig {
            source_arn: t.arn.clone(),
            batch_size: t.batch_size,
            batch_window: t.batch_window,
            max_concurrency: t.concurrency,
        };
        provider
            .create_queue_binding(&function_ref, &trigger, false)
            .await?;
    }

    info!("waiting for the new function version to become ready");
    tokio::time::timeout(
        PUBLISH_TIMEOUT,
        wait_on_function(provider, &spec.name, Some(&published.version.to_string())),
    )
    .await
    .map_err(|_| ControllerError::Timeout("function did not stabilize".into()))??;

    Ok(PublishResult {
        name: spec.name,
        arn: published.arn,
        version: published.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_statement_wire_casing() {
        let doc = serialize_role_policy(&[]).unwrap();
        assert!(doc.contains("\"Version\""));
        assert!(doc.contains("\"Effect\""));
        assert!(doc.contains("\"Action\""));
        assert!(doc.contains("\"Resource\""));
    }

    #[test]
    fn canonicalization_ignores_formatting() {
        let a = canonicalize_policy("{\"A\": [1, 2],\n  \"B\": \"x\"}").unwrap();
        let b = canonicalize_policy("{\"B\":\"x\",\"A\":[1,2]}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn generated_role_name_is_stable() {
        let extra = vec![RolePolicy {
            effect: "Allow".into(),
            action: vec!["s3:GetObject".into()],
            resource: vec!["*".into()],
        }];
        let a = generated_role_name(&canonicalize_policy(&serialize_role_policy(&extra).unwrap()).unwrap());
        let b = generated_role_name(&canonicalize_policy(&serialize_role_policy(&extra).unwrap()).unwrap());
        assert_eq!(a, b);
        assert!(a.starts_with(GENERATED_ROLE_PREFIX));

        let c = generated_role_name(&canonicalize_policy(&serialize_role_policy(&[]).unwrap()).unwrap());
        assert_ne!(a, c);
    }
}
