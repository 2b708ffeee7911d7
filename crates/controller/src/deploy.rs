use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::try_join_all;
use provider::{Provider, ScheduleConfig};
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::constants::{
    ACTIVE_ALIAS, BINDING_POLL_INTERVAL, DEPLOY_PHASE_TIMEOUT, PREACTIVE_ALIAS,
    PRIME_PROBE_INTERVAL, PRIME_TIMEOUT, PUBLIC_ACCESS_STATEMENT_ID,
    SCHEDULE_GROUP_RECREATE_TIMEOUT, SPEC_ENV_CORS, SPEC_ENV_CRON_PREFIX, UNDEPLOY_TIMEOUT,
};
use crate::error::{ControllerError, Result};
use crate::resolver::resolve_version;
use crate::retry::{retry_on_conflict, wait_on_function};

/// Knobs of the staged rollout. The defaults match production; tests
/// shrink the deadlines.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Concurrency of the second canary pass (1..=100).
    pub prime: usize,
    pub phase_timeout: Duration,
    pub prime_timeout: Duration,
    pub schedule_recreate_timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        DeployOptions {
            prime: 1,
            phase_timeout: DEPLOY_PHASE_TIMEOUT,
            prime_timeout: PRIME_TIMEOUT,
            schedule_recreate_timeout: SCHEDULE_GROUP_RECREATE_TIMEOUT,
        }
    }
}

fn phase_timed_out(phase: &str) -> ControllerError {
    ControllerError::Timeout(format!("deploy phase '{phase}' did not finish in time"))
}

/// Deploys a published version behind the public URL, verifying it on the
/// staging alias first. Returns the active URL.
pub async fn deploy(
    provider: &dyn Provider,
    name: &str,
    version: i64,
    prime: usize,
) -> Result<String> {
    deploy_with(
        provider,
        name,
        version,
        &DeployOptions {
            prime,
            ..Default::default()
        },
    )
    .await
}

pub async fn deploy_with(
    provider: &dyn Provider,
    name: &str,
    version: i64,
    opts: &DeployOptions,
) -> Result<String> {
    if !(1..=100).contains(&opts.prime) {
        return Err(ControllerError::Other(anyhow::anyhow!(
            "prime must be between 1 and 100"
        )));
    }

    // Phase 1: stage the version behind the preactive alias. Nothing that
    // happens from here on can affect live traffic until phase 5.

    info!("deploying to staging endpoint for testing");
    let preactive_url = timeout(
        opts.phase_timeout,
        stage_alias(provider, name, version, PREACTIVE_ALIAS),
    )
    .await
    .map_err(|_| phase_timed_out("stage"))??;

    // Phase 2: canary prime. A single probe first so a broken build does not
    // flood the logs, then the requested concurrency to warm instances.

    info!("waiting for function to return non-5xx");
    let hint = format!(
        "Check staging endpoint '{preactive_url}' and review logs by running 'lambdafy logs -s 15m -v {version} {name}'"
    );
    for workers in [1, opts.prime] {
        if let Err(e) = prime_url(&preactive_url, workers, opts.prime_timeout).await {
            return Err(ControllerError::CanaryFailure(e.to_string(), hint.clone()));
        }
    }
    info!("staging success");

    // Phase 3: queue cut-over. New-version bindings are enabled before the
    // old ones are disabled so no queue is ever left without a consumer.

    info!("transitioning queue triggers to the new version");
    timeout(
        opts.phase_timeout,
        set_queue_triggers(provider, name, version, true),
    )
    .await
    .map_err(|_| phase_timed_out("queue enable"))??;

    match resolve_version(provider, name, ACTIVE_ALIAS).await {
        Ok(old_version) if old_version != version => {
            timeout(
                opts.phase_timeout,
                set_queue_triggers(provider, name, old_version, false),
            )
            .await
            .map_err(|_| phase_timed_out("queue disable"))??;
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    // Phase 4: schedules are recreated wholesale from the version's cron
    // hints. Group deletion is eventually consistent, hence the conflict
    // retry on recreation.

    info!("(re-)creating cron triggers for the new version");
    let group = format!("lambdafy-{name}");
    match provider.delete_schedule_group(&group).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let versioned = provider.get_function(name, Some(&version.to_string())).await?;
    let crons: BTreeMap<String, String> = versioned
        .env
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(SPEC_ENV_CRON_PREFIX)
                .map(|n| (n.to_string(), v.clone()))
        })
        .collect();

    if !crons.is_empty() {
        match retry_on_conflict(opts.schedule_recreate_timeout, || {
            provider.create_schedule_group(&group)
        })
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        for (cron_name, expr) in &crons {
            // The payload tells the adapter which cron fired so it can pass
            // the name on to the app.
            let input = serde_json::json!({ "cron": cron_name }).to_string();
            provider
                .create_schedule(&ScheduleConfig {
                    name: format!("lambdafy-{name}-{cron_name}"),
                    group: group.clone(),
                    expression: expr.clone(),
                    target_arn: versioned.arn.clone(),
                    role_arn: versioned.role_arn.clone(),
                    input,
                })
                .await?;
        }
    }

    // Phase 5: cut the active alias over.

    info!("deploying to active endpoint");
    let active_url = timeout(
        opts.phase_timeout,
        stage_alias(provider, name, version, ACTIVE_ALIAS),
    )
    .await
    .map_err(|_| phase_timed_out("activate"))??;

    Ok(active_url)
}

/// Removes the deployment: queue triggers of the active version are
/// disabled and the active alias (with its URL and permission) deleted.
/// Versions and the staging alias are left untouched.
pub async fn undeploy(provider: &dyn Provider, name: &str) -> Result<()> {
    info!("disabling queue triggers");
    match resolve_version(provider, name, ACTIVE_ALIAS).await {
        Ok(version) => {
            timeout(
                UNDEPLOY_TIMEOUT,
                set_queue_triggers(provider, name, version, false),
            )
            .await
            .map_err(|_| phase_timed_out("queue disable"))??;
            timeout(
                UNDEPLOY_TIMEOUT,
                wait_on_function(provider, name, Some(ACTIVE_ALIAS)),
            )
            .await
            .map_err(|_| phase_timed_out("stabilize"))??;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!("deleting the function url endpoint");
    match retry_on_conflict(UNDEPLOY_TIMEOUT, || {
        provider.delete_alias(name, ACTIVE_ALIAS)
    })
    .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Creates or updates `alias` at `version`, its public URL (CORS taken from
/// the version's environment hint) and the public-invoke permission.
/// Returns the alias URL.
async fn stage_alias(
    provider: &dyn Provider,
    name: &str,
    version: i64,
    alias: &str,
) -> Result<String> {
    match retry_on_conflict(DEPLOY_PHASE_TIMEOUT, || {
        provider.create_alias(name, alias, version)
    })
    .await
    {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {
            retry_on_conflict(DEPLOY_PHASE_TIMEOUT, || {
                provider.update_alias(name, alias, version)
            })
            .await?;
        }
        Err(e) => return Err(e),
    }

    let info = provider.get_function(name, Some(alias)).await?;
    let cors: provider::CorsConfig = info
        .env
        .get(SPEC_ENV_CORS)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default();

    let url = match retry_on_conflict(DEPLOY_PHASE_TIMEOUT, || {
        provider.create_function_url(name, alias, &cors)
    })
    .await
    {
        Ok(url) => url,
        Err(e) if e.is_already_exists() => {
            retry_on_conflict(DEPLOY_PHASE_TIMEOUT, || {
                provider.update_function_url(name, alias, &cors)
            })
            .await?
        }
        Err(e) => return Err(e),
    };

    match retry_on_conflict(DEPLOY_PHASE_TIMEOUT, || {
        provider.add_public_invoke_permission(name, alias, PUBLIC_ACCESS_STATEMENT_ID)
    })
    .await
    {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e),
    }

    Ok(url)
}

/// Flips every queue binding of `name:version` to the desired state, then
/// polls until the provider reports all of them settled there.
pub(crate) async fn set_queue_triggers(
    provider: &dyn Provider,
    name: &str,
    version: i64,
    enable: bool,
) -> Result<()> {
    let bindings: Vec<_> = provider
        .list_queue_bindings(&format!("{name}:{version}"))
        .await?
        .into_iter()
        .filter(|b| b.source_arn.starts_with("arn:aws:sqs:"))
        .collect();

    try_join_all(bindings.iter().map(|b| {
        retry_on_conflict(DEPLOY_PHASE_TIMEOUT, move || {
            provider.set_queue_binding_enabled(&b.uuid, enable)
        })
    }))
    .await?;

    let desired = if enable { "Enabled" } else { "Disabled" };
    loop {
        let mut settled = true;
        for b in &bindings {
            if provider.get_queue_binding_state(&b.uuid).await? != desired {
                settled = false;
                break;
            }
        }
        if settled {
            return Ok(());
        }
        sleep(BINDING_POLL_INTERVAL).await;
    }
}

/// Hits the staging URL with `workers` concurrent probes until every worker
/// has seen three consecutive responses below 500, or the deadline passes.
async fn prime_url(url: &str, workers: usize, deadline: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let all_warm = try_join_all((0..workers).map(|_| {
        let client = client.clone();
        async move {
            let mut consecutive = 0u32;
            loop {
                match client.get(url).send().await {
                    Ok(resp) if (200..500).contains(&resp.status().as_u16()) => {
                        consecutive += 1;
                        if consecutive == 3 {
                            return Ok::<(), anyhow::Error>(());
                        }
                    }
                    Ok(_) | Err(_) => {
                        consecutive = 0;
                        sleep(PRIME_PROBE_INTERVAL).await;
                    }
                }
            }
        }
    }));

    match timeout(deadline, all_warm).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(anyhow::anyhow!("timed out waiting for instances to warm up")),
    }
}
