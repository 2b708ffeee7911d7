use fnspec::{Cors, EfsMount, ROLE_GENERATE, RolePolicy, Spec};
use provider::{CorsConfig, Provider};

use crate::constants::{GENERATED_ROLE_PREFIX, SPEC_ENV_CORS, SPEC_ENV_CRON_PREFIX, SPEC_ENV_PREFIX};
use crate::error::{ControllerError, Result};
use crate::publish::{PolicyDocument, canonicalize_policy, generated_role_name};

/// Reconstructs a function spec from a published version, recovering
/// generated-role policies and the deploy-time hints embedded in the
/// environment.
pub async fn generate_spec(provider: &dyn Provider, name: &str, version: i64) -> Result<Spec> {
    let info = provider
        .get_function(name, Some(&version.to_string()))
        .await?;
    let image = info.image_uri.ok_or_else(|| {
        ControllerError::Other(anyhow::anyhow!(
            "function {name} is not a container image function"
        ))
    })?;

    let mut spec = Spec::default();
    spec.name = name.to_string();
    spec.description = info.description;
    spec.image = image;
    spec.role = info.role_arn.clone();
    spec.entrypoint = info.entrypoint;
    spec.command = info.command;
    spec.workdir = info.workdir;
    spec.memory = info.memory;
    spec.timeout = info.timeout;
    spec.temp_size = info.temp_size;
    spec.tags = info.tags;
    spec.vpc_security_group_ids = info.security_group_ids;
    spec.vpc_security_group_ids.sort();
    spec.vpc_subnet_ids = info.subnet_ids;
    spec.vpc_subnet_ids.sort();
    spec.efs_mounts = info
        .efs_mounts
        .into_iter()
        .map(|m| EfsMount {
            arn: m.arn,
            path: m.path,
        })
        .collect();

    // The environment hints were added at publish time; fold them back into
    // their spec fields instead of leaking them as plain env vars.
    for (k, v) in info.env {
        if let Some(cron_name) = k.strip_prefix(SPEC_ENV_CRON_PREFIX) {
            spec.cron.insert(cron_name.to_string(), v);
        } else if k == SPEC_ENV_CORS {
            if let Ok(cors) = serde_json::from_str::<CorsConfig>(&v) {
                if !(cors.origins.is_empty() && cors.methods.is_empty() && cors.headers.is_empty())
                {
                    spec.cors = Some(Cors {
                        origins: cors.origins,
                        methods: cors.methods,
                        headers: cors.headers,
                    });
                }
            }
        } else if !k.starts_with(SPEC_ENV_PREFIX) {
            spec.env.insert(k, v);
        }
    }

    // Pin the generated spec to where the function actually lives.
    let ident = provider.caller_identity().await?;
    spec.allowed_account_regions = vec![format!("{}:{}", ident.account, ident.region)];

    // When the role was generated from a policy, recover `role: generate`
    // plus the extra statements so the spec publishes back unchanged.
    let role_name = info
        .role_arn
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if role_name.starts_with(GENERATED_ROLE_PREFIX) {
        match provider.get_role_policy(&role_name, "main").await {
            Ok(doc) => {
                let canonical = canonicalize_policy(&doc)?;
                if generated_role_name(&canonical) == role_name {
                    let parsed: PolicyDocument =
                        serde_json::from_str(&canonical).map_err(anyhow::Error::from)?;
                    spec.role = ROLE_GENERATE.to_string();
                    // The first statement is the default one added on
                    // publish; only the extras belong in the spec.
                    spec.role_extra_policy = parsed
                        .statement
                        .into_iter()
                        .skip(1)
                        .map(RolePolicy::from)
                        .collect();
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(spec)
}
