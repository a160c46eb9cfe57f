//! Airdock - local session broker for an AI coding agent

use airdock::{
    config::BrokerConfig,
    engine::ClaudeCli,
    git::GitCli,
    Broker,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "airdock")]
#[command(author = "Airdock Team")]
#[command(version)]
#[command(about = "Local session broker that drives an AI coding agent from thin clients")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AIRDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, env = "AIRDOCK_PORT")]
        port: Option<u16>,

        /// Project working tree (defaults to the current directory)
        #[arg(long)]
        project_root: Option<PathBuf>,

        /// Shared secret clients must pass as `?secret=`
        #[arg(long, env = "AIRDOCK_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            project_root,
            secret,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(root) = project_root {
                config.project.root = Some(root);
            }
            if secret.is_some() {
                config.server.secret = secret;
            }
            config.validate()?;
            run_serve(config).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("airdock={},tower_http={}", log_level, log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Explicit `--config`, else the default location if it exists, else defaults
fn load_config(path: Option<&std::path::Path>) -> Result<BrokerConfig> {
    if let Some(path) = path {
        return BrokerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }
    match BrokerConfig::default_path() {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "Using default config file");
            Ok(BrokerConfig::load(&path)?)
        }
        _ => Ok(BrokerConfig::default()),
    }
}

async fn run_serve(config: BrokerConfig) -> Result<()> {
    let project_root = config.project.root_dir();
    tracing::info!(project = %project_root.display(), "Starting Airdock broker");

    let engine = Arc::new(ClaudeCli::new(config.engine.clone()));
    let git = Arc::new(GitCli::new(project_root).with_pr_lookup(config.git.pr_lookup));
    let broker = Broker::new(config, engine, git);

    let addr = broker.start().await?;
    tracing::info!(address = %addr, "Airdock is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    broker.stop().await;

    Ok(())
}

fn show_config(config: Option<&BrokerConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
