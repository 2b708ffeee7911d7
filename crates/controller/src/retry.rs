use std::future::Future;
use std::time::Duration;

use provider::{FunctionState, Provider};
use tokio::time::sleep;

use crate::constants::{RETRY_INTERVAL, STABILIZE_POLL_INTERVAL};
use crate::error::{ControllerError, Result};

/// Runs a provider write, retrying the transient error kinds (resource
/// conflicts, not-yet-assumable roles, not-yet-valid principals) once a
/// second until `deadline` elapses. Non-transient errors are returned
/// immediately with their kind intact so callers can branch on
/// already-exists / not-found.
pub async fn retry_on_conflict<T, F, Fut>(deadline: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = provider::Result<T>>,
{
    let attempt_loop = async {
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => sleep(RETRY_INTERVAL).await,
                Err(e) => return Err(ControllerError::from(e)),
            }
        }
    };
    tokio::time::timeout(deadline, attempt_loop)
        .await
        .map_err(|_| ControllerError::Timeout("retries exhausted waiting on provider".into()))?
}

/// Polls the function state every two seconds until it reaches `Active`.
/// `Pending` keeps polling; anything else fails. There is no deadline here;
/// callers wrap the wait in their phase timeout.
pub async fn wait_on_function(
    provider: &dyn Provider,
    name: &str,
    qualifier: Option<&str>,
) -> Result<()> {
    loop {
        let info = provider.get_function(name, qualifier).await?;
        match info.state {
            Some(FunctionState::Active) => return Ok(()),
            Some(FunctionState::Pending) | None => sleep(STABILIZE_POLL_INTERVAL).await,
            Some(FunctionState::Other(s)) => {
                return Err(ControllerError::Other(anyhow::anyhow!(
                    "invalid state while polling function '{name}': {s}"
                )));
            }
        }
    }
}
