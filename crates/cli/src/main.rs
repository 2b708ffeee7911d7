mod cli;
mod output;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::Parser;
use docker::{AdapterBinary, ImageManager};
use dotenvy::dotenv;
use fnspec::Spec;
use provider::Provider;
use provider_aws::AwsProvider;
use serde_json::json;
use tracing::info;

use crate::cli::{Cli, Commands, SqsCommands};
use crate::output::format_output;

static EXAMPLE_SPEC: &str = include_str!("../example-spec.yaml");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await
}

/// Locates the adapter binary: an explicit override, or the file shipped
/// next to the executable. Its hash is computed once here.
fn load_adapter() -> anyhow::Result<AdapterBinary> {
    let path = match std::env::var_os("LAMBDAFY_PROXY_PATH") {
        Some(p) => PathBuf::from(p),
        None => std::env::current_exe()?
            .parent()
            .context("executable has no parent directory")?
            .join("lambdafy-proxy"),
    };
    let bytes = std::fs::read(&path)
        .with_context(|| format!("cannot read adapter binary at '{}'", path.display()))?;
    Ok(AdapterBinary::new(bytes))
}

fn parse_vars(vars: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for v in vars {
        let Some((key, value)) = v.split_once('=') else {
            bail!("invalid var: {v}");
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn read_spec(path: &str, vars: &BTreeMap<String, String>) -> anyhow::Result<Spec> {
    let spec = if path == "-" {
        let mut doc = String::new();
        std::io::stdin().read_to_string(&mut doc)?;
        Spec::load(doc.as_bytes(), vars)?
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open spec file '{path}'"))?;
        Spec::load(file, vars)?
    };
    Ok(spec)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let template = cli.output.clone();

    match cli.command {
        Commands::Make { image } => {
            let adapter = load_adapter()?;
            let images = ImageManager::new()?;
            images.prepare(&image, &adapter).await?;
        }

        Commands::Push { image, repo, create } => {
            let provider = AwsProvider::new().await?;
            let images = ImageManager::new()?;
            let repo_uri = provider.ensure_repository(&repo, create).await?;
            let auth = provider.registry_auth().await?;
            let pushed = images.push(&image, &repo_uri, &auth).await?;
            println!("{pushed}");
        }

        Commands::Publish {
            spec_file,
            alias,
            force_update_alias,
            vars,
        } => {
            let vars = parse_vars(&vars)?;
            let spec = read_spec(&spec_file, &vars)?;
            let adapter = if spec.needs_build_and_push() {
                Some(load_adapter()?)
            } else {
                None
            };
            let provider = AwsProvider::new().await?;
            let result = controller::publish(&provider, adapter.as_ref(), spec).await?;
            if !alias.is_empty() {
                controller::alias(
                    &provider,
                    &result.name,
                    &result.version.to_string(),
                    &alias,
                    force_update_alias,
                )
                .await?;
                format_output(
                    &json!({
                        "name": result.name,
                        "arn": result.arn,
                        "version": result.version.to_string(),
                        "alias": alias,
                    }),
                    &template,
                )?;
            } else {
                format_output(&result, &template)?;
            }
        }

        Commands::Deploy {
            function,
            version,
            prime,
        } => {
            if !(1..=100).contains(&prime) {
                bail!("--prime must be between 1 and 100");
            }
            let provider = AwsProvider::new().await?;
            let version = controller::resolve_version(&provider, &function, &version)
                .await
                .with_context(|| format!("failed to resolve version '{version}'"))?;
            let url = controller::deploy(&provider, &function, version, prime).await?;
            format_output(
                &json!({
                    "name": function,
                    "version": version.to_string(),
                    "url": url,
                }),
                &template,
            )?;
        }

        Commands::Undeploy { function, yes } => {
            if !yes {
                bail!("must pass --yes to actually undeploy the '{function}' function");
            }
            let provider = AwsProvider::new().await?;
            controller::undeploy(&provider, &function).await?;
        }

        Commands::Delete { function, yes } => {
            if !yes {
                bail!("must pass --yes to actually delete the function");
            }
            let provider = AwsProvider::new().await?;
            controller::delete_function(&provider, &function).await?;
        }

        Commands::Alias {
            function,
            version,
            alias,
            force,
        } => {
            let provider = AwsProvider::new().await?;
            controller::alias(&provider, &function, &version, &alias, force).await?;
        }

        Commands::Unalias { function, alias } => {
            let provider = AwsProvider::new().await?;
            controller::unalias(&provider, &function, &alias).await?;
        }

        Commands::List => {
            let provider = AwsProvider::new().await?;
            for name in controller::list_functions(&provider).await? {
                println!("{name}");
            }
        }

        Commands::Info {
            function,
            version,
            key,
        } => {
            let provider = AwsProvider::new().await?;
            let info = controller::function_info(&provider, &function, &version).await?;
            if !key.is_empty() {
                let value = info
                    .get(&key)
                    .with_context(|| format!("key '{key}' not found"))?;
                println!("{value}");
            } else {
                for (k, v) in &info {
                    println!("{k}={v}");
                }
            }
        }

        Commands::Versions { function } => {
            let provider = AwsProvider::new().await?;
            for v in controller::versions(&provider, &function).await? {
                println!("{}:{}:{}", v.version, v.aliases.join(","), v.description);
            }
        }

        Commands::Spec { function, version } => {
            let provider = AwsProvider::new().await?;
            let version = controller::resolve_version(&provider, &function, &version).await?;
            let spec = controller::generate_spec(&provider, &function, version).await?;
            println!("# Generated by 'lambdafy spec --version {version} {function}'\n");
            spec.save(std::io::stdout())?;
        }

        Commands::Logs {
            function,
            version,
            tail,
            since,
        } => {
            let provider = AwsProvider::new().await?;
            let version = controller::resolve_version(&provider, &function, &version).await?;
            info!("printing logs for version {version}");
            let mut window = Duration::from_secs(since * 60);
            let mut last_seen = 0i64;
            loop {
                for event in
                    controller::fetch_logs(&provider, &function, version, window).await?
                {
                    if event.timestamp_ms <= last_seen {
                        continue;
                    }
                    last_seen = event.timestamp_ms;
                    println!("{}", event.message);
                }
                if !tail {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                window = Duration::from_secs(60);
            }
        }

        Commands::Sqs { command } => {
            let provider = AwsProvider::new().await?;
            match command {
                SqsCommands::Add {
                    function,
                    arn,
                    batch_size,
                } => controller::sqs_add(&provider, &function, &arn, batch_size).await?,
                SqsCommands::Remove { function, arn } => {
                    controller::sqs_remove(&provider, &function, Some(&arn)).await?
                }
                SqsCommands::RemoveAll { function } => {
                    controller::sqs_remove(&provider, &function, None).await?
                }
                SqsCommands::List { function } => {
                    let triggers = controller::sqs_list(&provider, &function).await?;
                    format_output(&triggers, &template)?;
                }
            }
        }

        Commands::ExampleSpec => {
            print!("{EXAMPLE_SPEC}");
        }

        Commands::CleanupRoles => {
            let provider = AwsProvider::new().await?;
            let removed = controller::cleanup_roles(&provider).await?;
            for role in removed {
                println!("{role}");
            }
        }
    }

    Ok(())
}
