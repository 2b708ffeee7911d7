use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use provider::Provider;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::constants::PUBLISH_TIMEOUT;
use crate::error::{ControllerError, Result};
use crate::retry::retry_on_conflict;

/// Version spec naming the highest published version.
pub const LATEST_PSEUDO_VERSION: &str = "latest";

const ALIAS_PAT_STR: &str = "^[a-zA-Z_][a-zA-Z0-9_-]*$";
static ALIAS_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(ALIAS_PAT_STR).unwrap());

/// Resolves a user-supplied version spec to a numeric version: a number is
/// returned as-is, `latest` resolves to the highest published version, and
/// anything else is looked up as an alias.
pub async fn resolve_version(provider: &dyn Provider, name: &str, spec: &str) -> Result<i64> {
    if spec.is_empty() {
        return Err(ControllerError::Other(anyhow::anyhow!(
            "version spec must not be empty"
        )));
    }
    if let Ok(v) = spec.parse::<i64>() {
        return Ok(v);
    }
    if spec == LATEST_PSEUDO_VERSION {
        let vers = versions(provider, name).await?;
        return vers
            .last()
            .map(|v| v.version)
            .ok_or_else(|| ControllerError::Provider(provider::ProviderError::NotFound(
                format!("function {name} has no published versions"),
            )));
    }
    Ok(provider.get_alias(name, spec).await?)
}

/// A published version together with the aliases pointing at it.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionVersion {
    pub version: i64,
    pub aliases: Vec<String>,
    pub description: String,
}

/// All published versions of a function, ascending, each annotated with its
/// aliases in alphabetical order.
pub async fn versions(provider: &dyn Provider, name: &str) -> Result<Vec<FunctionVersion>> {
    let mut by_version: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for a in provider.list_aliases(name).await? {
        by_version.entry(a.version).or_default().push(a.name);
    }
    for aliases in by_version.values_mut() {
        aliases.sort();
    }

    let mut out: Vec<FunctionVersion> = provider
        .list_versions(name)
        .await?
        .into_iter()
        .map(|v| FunctionVersion {
            version: v.version,
            aliases: by_version.remove(&v.version).unwrap_or_default(),
            description: v.description,
        })
        .collect();
    out.sort_by_key(|v| v.version);
    Ok(out)
}

/// Points `alias_name` at the resolved version, updating an existing alias
/// only when `force` is set.
pub async fn alias(
    provider: &dyn Provider,
    name: &str,
    version_spec: &str,
    alias_name: &str,
    force: bool,
) -> Result<()> {
    if !ALIAS_PAT.is_match(alias_name) {
        return Err(ControllerError::InvalidAliasName(
            alias_name.to_string(),
            ALIAS_PAT_STR,
        ));
    }
    let version = resolve_version(provider, name, version_spec).await?;

    match retry_on_conflict(PUBLISH_TIMEOUT, || {
        provider.create_alias(name, alias_name, version)
    })
    .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            if !force {
                return Err(ControllerError::Other(anyhow::anyhow!(
                    "alias '{alias_name}' already exists"
                )));
            }
            debug!("alias '{alias_name}' exists - updating");
            retry_on_conflict(PUBLISH_TIMEOUT, || {
                provider.update_alias(name, alias_name, version)
            })
            .await
        }
        Err(e) => Err(e),
    }
}

/// Deletes an alias; a missing alias counts as success.
pub async fn unalias(provider: &dyn Provider, name: &str, alias_name: &str) -> Result<()> {
    match provider.delete_alias(name, alias_name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
