//! evalboard CLI
//!
//! - `serve`: run the REST API
//! - `run`: evaluate one dataset file against one model and print the run
//! - `config`: print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evalboard_core::{NewDataset, NewRun, RunOutcome};
use evalboard_server::{routes, telemetry, AppConfig, AppState};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// LLM evaluation runs: execute, score and rank
#[derive(Parser, Debug)]
#[command(name = "evalboard", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the REST API
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Evaluate a dataset file and print the finished run as JSON
    Run {
        /// Dataset JSON: `{"name": ..., "items": [{"input": ..., "expected_output": ...}]}`
        #[arg(long)]
        dataset: PathBuf,
        /// Model id passed to the provider
        #[arg(long)]
        model: String,
        /// Configured provider id
        #[arg(long, default_value = "mock")]
        provider: String,
        /// Run name; defaults to the model id
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    if let Command::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    telemetry::init(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    tracing::info!(version = evalboard_core::VERSION, "evalboard starting");

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config = config.with_bind(bind);
            }
            serve(&config).await
        }
        Command::Run {
            dataset,
            model,
            provider,
            name,
        } => run_once(&config, &dataset, model, provider, name).await,
        Command::Config => Ok(()),
    }
}

async fn serve(config: &AppConfig) -> Result<()> {
    let state = AppState::from_config(config)?;
    let recovered = state.recover().await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "marked interrupted runs as failed");
    }

    let (addr, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(config.server.bind, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    tracing::info!(%addr, "listening");
    server.await;
    tracing::info!("shut down");
    Ok(())
}

async fn run_once(
    config: &AppConfig,
    dataset_path: &Path,
    model: String,
    provider: String,
    name: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(dataset_path)
        .with_context(|| format!("failed to read {}", dataset_path.display()))?;
    let new: NewDataset = serde_json::from_str(&text)
        .with_context(|| format!("invalid dataset file {}", dataset_path.display()))?;

    // No recovery here: a server sharing this store may own running runs
    let state = AppState::from_config(config)?;
    let (run, outcome) = state
        .evaluate(new, |dataset_id| {
            NewRun::new(
                name.unwrap_or_else(|| model.clone()),
                dataset_id,
                provider,
                model,
            )
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&run)?);

    if let RunOutcome::Failed { error } = outcome {
        bail!("run failed: {error}");
    }
    Ok(())
}
