use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proactive_agent::{AgentConfig, AgentRuntime};
use shared_logging::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "proactive_agent",
    version,
    about = "Watches directories and reacts to file changes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the agent until Ctrl-C.
    Run {
        /// Path to the TOML configuration.
        #[arg(long, default_value = "agent.toml")]
        config: PathBuf,
    },
    /// Loads the configuration and prints the resolved settings.
    Validate {
        /// Path to the TOML configuration.
        #[arg(long, default_value = "agent.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Validate { config } => validate(config),
    }
}

async fn run(path: PathBuf) -> Result<()> {
    let config = AgentConfig::load(&path)?;
    init_tracing(&config.logging.level)?;
    info!(config = %path.display(), "starting proactive agent");

    let mut runtime = AgentRuntime::from_config(&config)
        .await
        .context("failed to wire agent runtime")?;
    runtime.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    let report = runtime.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn validate(path: PathBuf) -> Result<()> {
    let config = AgentConfig::load(&path)?;
    println!("{}", serde_json::to_string_pretty(&config.redacted())?);
    Ok(())
}
