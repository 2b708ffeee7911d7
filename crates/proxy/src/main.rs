use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use lambdafy_proxy::{envderef, runtime, sqs};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rand::Rng;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        anyhow::bail!("usage: {} command [arg [arg [...]]]", args[0]);
    }

    let in_serverless_host = std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some()
        && std::env::var_os("AWS_LAMBDA_RUNTIME_API").is_some();

    // A random port keeps the user program from depending on a fixed one.
    let app_port: u16 = rand::thread_rng().gen_range(19000..20000);
    let side_port = app_port + 1;
    let app_endpoint = format!("127.0.0.1:{app_port}");

    let send_queues = envderef::process_env(side_port).await?;

    if !in_serverless_host {
        // Local execution: become the user program outright.
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&args[1]).args(&args[2..]).exec();
        return Err(anyhow::Error::from(err)
            .context(format!("cannot run command '{}'", args[1])));
    }

    info!("running in serverless host, proxying traffic to {app_endpoint}");

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let ctx = Arc::new(runtime::Context {
        client: client.clone(),
        app_endpoint: app_endpoint.clone(),
    });

    // Register with the host right away; invocations queue against the
    // readiness gate instead of timing out while the app boots.
    let (ready_tx, ready_rx) = watch::channel(false);
    tokio::spawn(runtime::run_event_loop(ctx, ready_rx));

    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let side = Arc::new(sqs::SideChannel {
        send_queues,
        sqs: aws_sdk_sqs::Client::new(&aws),
    });
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", side_port))
        .await
        .context("failed to bind side-channel listener")?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, sqs::side_channel_router(side)).await {
            error!("side-channel server failed: {e}");
        }
    });

    // SAFETY: set before the child is spawned; no other thread reads PORT.
    unsafe { std::env::set_var("PORT", app_port.to_string()) };

    let mut child = match tokio::process::Command::new(&args[1])
        .args(&args[2..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("failed to run command '{}': {e}", args[1]);
            return Ok(127);
        }
    };
    if let Some(pid) = child.id() {
        forward_signals(pid as i32);
    }

    info!("waiting for startup request to succeed");
    let probe_url = format!("http://{app_endpoint}/");
    let probe = async {
        // Any response at all, errors from the app included, means the
        // listener is up.
        loop {
            if client.get(&probe_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    tokio::select! {
        _ = probe => {}
        status = child.wait() => {
            let status = status?;
            error!("command exited before serving its first request");
            return Ok(status.code().unwrap_or(127));
        }
    }

    info!("startup request passed - proxying requests from now on");
    let _ = ready_tx.send(true);

    // The child owns the container lifetime; when it goes, so do we.
    let status = child.wait().await?;
    Ok(status.code().unwrap_or(127))
}

/// Relays every relayable Unix signal to the child.
fn forward_signals(pid: i32) {
    let kinds = [
        (SignalKind::hangup(), Signal::SIGHUP),
        (SignalKind::interrupt(), Signal::SIGINT),
        (SignalKind::quit(), Signal::SIGQUIT),
        (SignalKind::terminate(), Signal::SIGTERM),
        (SignalKind::user_defined1(), Signal::SIGUSR1),
        (SignalKind::user_defined2(), Signal::SIGUSR2),
    ];
    for (kind, sig) in kinds {
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        let _ = kill(Pid::from_raw(pid), sig);
                    }
                });
            }
            Err(e) => error!("failed to install handler for {sig:?}: {e}"),
        }
    }
}
