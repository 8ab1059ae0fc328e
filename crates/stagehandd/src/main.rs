//! stagehandd — the Stagehand daemon.
//!
//! Single binary that runs every Stagehand subsystem:
//! - State store (redb)
//! - Image registry index
//! - Release orchestrator + promotion dispatcher
//! - Autoscale supervisor
//! - REST API
//!
//! # Usage
//!
//! ```text
//! stagehandd run --config /etc/stagehand/stagehand.toml --data-dir /var/lib/stagehand
//! stagehandd check-config --config /etc/stagehand/stagehand.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagehandd::{Daemon, StagehandConfig};

const DEFAULT_LOG_FILTER: &str = "info,stagehandd=debug,stagehand=debug";

#[derive(Parser)]
#[command(name = "stagehandd", about = "Stagehand release orchestrator and autoscaler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Configuration file.
        #[arg(long, default_value = "/etc/stagehand/stagehand.toml")]
        config: PathBuf,

        /// Data directory for persistent state; overrides `[state]`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Port to listen on; overrides `[server]`.
        #[arg(long)]
        port: Option<u16>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/stagehand/stagehand.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            log_json,
        } => {
            init_tracing(log_json)?;
            let mut config = StagehandConfig::from_file(&config)?;
            if let Some(data_dir) = data_dir {
                config.state.data_dir = data_dir;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(
                environments = config.environments.len(),
                services = config.services.len(),
                "stagehand daemon starting"
            );
            Daemon::build(config)?.run().await
        }
        Command::CheckConfig { config: path } => {
            let config = StagehandConfig::from_file(&path)?;
            let pipeline = config.pipeline()?;
            let order: Vec<_> = pipeline
                .environments()
                .iter()
                .map(|env| env.name.as_str())
                .collect();
            println!(
                "{}: ok ({} services, pipeline {})",
                path.display(),
                config.services.len(),
                order.join(" -> ")
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
