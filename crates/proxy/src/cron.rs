use anyhow::{Context as _, bail};

/// Reports a schedule tick to the user program. Anything outside `[200,400)`
/// fails the invocation so the host records it.
pub async fn handle_cron(
    client: &reqwest::Client,
    app_endpoint: &str,
    cron_name: &str,
) -> anyhow::Result<()> {
    let url = format!(
        "http://{app_endpoint}/_lambdafy/cron?name={}",
        urlencoding::encode(cron_name)
    );
    let resp = client
        .post(&url)
        .header(reqwest::header::CONTENT_LENGTH, "0")
        .send()
        .await
        .with_context(|| format!("error sending HTTP request for cron '{cron_name}'"))?;
    let status = resp.status().as_u16();
    if !(200..400).contains(&status) {
        bail!("cron '{cron_name}' handler returned status {status}");
    }
    Ok(())
}
