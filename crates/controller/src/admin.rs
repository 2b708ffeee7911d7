use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use provider::{LogEvent, Provider};
use tracing::info;

use crate::constants::{GENERATED_ROLE_PREFIX, UNDEPLOY_TIMEOUT};
use crate::error::{ControllerError, Result};
use crate::resolver::{resolve_version, LATEST_PSEUDO_VERSION};
use crate::retry::retry_on_conflict;

/// Deletes the function and everything hanging off it (versions, aliases,
/// URLs). A missing function counts as success.
pub async fn delete_function(provider: &dyn Provider, name: &str) -> Result<()> {
    match retry_on_conflict(UNDEPLOY_TIMEOUT, || provider.delete_function(name)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// All function names, sorted.
pub async fn list_functions(provider: &dyn Provider) -> Result<Vec<String>> {
    let mut names = provider.list_functions().await?;
    names.sort();
    Ok(names)
}

/// Key/value facts about one version of a function.
pub async fn function_info(
    provider: &dyn Provider,
    name: &str,
    version_spec: &str,
) -> Result<BTreeMap<String, String>> {
    let mut inf = BTreeMap::new();
    inf.insert("name".to_string(), name.to_string());

    let mut qualifier = version_spec.to_string();
    if version_spec == LATEST_PSEUDO_VERSION {
        qualifier = resolve_version(provider, name, version_spec)
            .await?
            .to_string();
    } else if version_spec.parse::<i64>().is_err() {
        // An alias: it also carries the public URL.
        match provider.get_alias(name, version_spec).await {
            Ok(version) => {
                inf.insert("version".to_string(), version.to_string());
                let url = provider.get_function_url(name, version_spec).await?;
                inf.insert("url".to_string(), url);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let info = provider.get_function(name, Some(&qualifier)).await?;
    let image = info.image_uri.ok_or_else(|| {
        ControllerError::Other(anyhow::anyhow!(
            "function {name} is not a container image function"
        ))
    })?;

    inf.insert("version".to_string(), info.version);
    inf.insert("image".to_string(), image);
    if let Some(resolved) = info.resolved_image_uri {
        inf.insert("resolved-image".to_string(), resolved);
    }
    inf.insert("role".to_string(), info.role_arn);
    inf.insert("timestamp".to_string(), info.last_modified);
    Ok(inf)
}

/// Deletes generated roles not referenced by any function. Returns the
/// names of the removed roles.
pub async fn cleanup_roles(provider: &dyn Provider) -> Result<Vec<String>> {
    let candidates = provider
        .list_roles_with_prefix(GENERATED_ROLE_PREFIX)
        .await?;

    let mut in_use = BTreeSet::new();
    for name in provider.list_functions().await? {
        match provider.get_function(&name, None).await {
            Ok(info) => {
                in_use.insert(info.role_arn);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut removed = Vec::new();
    for role in candidates {
        let arn = provider.get_role_arn(&role).await?;
        if in_use.contains(&arn) {
            continue;
        }
        info!("removing unused generated role '{role}'");
        provider.delete_role(&role).await?;
        removed.push(role);
    }
    Ok(removed)
}

/// Log lines of one version covering the trailing `since` window.
pub async fn fetch_logs(
    provider: &dyn Provider,
    name: &str,
    version: i64,
    since: Duration,
) -> Result<Vec<LogEvent>> {
    let start_ms = chrono::Utc::now().timestamp_millis() - since.as_millis() as i64;
    Ok(provider.function_log_events(name, version, start_ms).await?)
}
