use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docweave::{Config, ModuleRegistry, SourceManager};
use prometheus::{Encoder, TextEncoder};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "docweave=debug,info";

#[derive(Debug, Parser)]
#[command(name = "docweave", version, about = "Aggregate content sources into one page tree")]
struct Cli {
    /// Configuration file. Defaults to ./docweave.toml when present.
    #[arg(short, long, env = "DOCWEAVE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the plugin order.
    Check,
    /// Start every source and keep the union view up to date until Ctrl-C.
    Run,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.logging.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });
    let json = config.logging.json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Command::Check => check(config).await,
        Command::Run => run(config).await,
    }
}

async fn check(config: Config) -> anyhow::Result<()> {
    let manager = SourceManager::from_config(config, ModuleRegistry::with_builtins())?;
    let order = manager.compiled_plugins().await;

    println!("configuration ok");
    println!("sources: {}", manager.config().enabled_sources().count());
    println!("plugins: {}", order.join(" -> "));
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(deployment) = &config.deployment {
        info!(mode = ?deployment.mode, platform = ?deployment.platform, "Deployment");
    }

    let manager = SourceManager::from_config(config, ModuleRegistry::with_builtins())?;
    let _updates = manager.on_source_update(|update| {
        info!(source = %update.source, path = %update.path, kind = ?update.kind, "Update");
    });
    let _errors = manager.on_source_error(|event| {
        warn!(source = %event.name(), event = ?event, "Source error");
    });

    let started = manager.start().await?;
    info!(started, "Docweave running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.stop().await?;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&manager.metrics_registry().gather(), &mut buffer)?;
    tracing::debug!(metrics = %String::from_utf8_lossy(&buffer), "Final metrics");
    Ok(())
}
