//! Supernetes agent binary

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use supernetes_agent::{agent, dispatch, timestamp};
use supernetes_common::config::{self, AgentConfig};
use supernetes_common::telemetry;

/// Supernetes agent - bridges an HPC scheduler to a Supernetes controller
#[derive(Parser, Debug)]
#[command(name = "supernetes-agent", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Supernetes agent
    Run {
        /// Path to the agent configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Log level directive
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },
    /// Prepend RFC 3339 timestamps to each stdin line and print to stdout.
    /// Internal command used for processing workload log data.
    Timestamp,
    /// Internal command that takes a Base64-encoded array of container
    /// specifications and executes them in parallel; executed by the HPC
    /// scheduler inside a batch allocation.
    Dispatch {
        /// Base64-encoded container specifications
        containers: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_level } => {
            telemetry::init(Some(&log_level));
            run(config).await
        }
        Commands::Timestamp => {
            telemetry::init(None);
            timestamp::run()?;
            Ok(())
        }
        Commands::Dispatch { containers } => {
            telemetry::init(None);
            let code = dispatch::run(&containers).await?;
            std::process::exit(code);
        }
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(path = %config_path.display(), "reading configuration file");
    let config_bytes = std::fs::read(&config_path)?;
    let config: AgentConfig = config::decode(&config_bytes)?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("agent initiated shutdown");
            shutdown.cancel();
        }
    });

    agent::run(config, token).await?;
    Ok(())
}
