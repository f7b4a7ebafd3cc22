//! fleetd: the fleet director.
//!
//! One binary over the director's subsystems:
//! - inventory store (redb)
//! - rolling updates with incremental local DNS
//! - deployment teardown
//! - cloud-check
//!
//! # Usage
//!
//! ```text
//! fleetd --config fleetd.toml deploy --manifest simple.toml
//! fleetd --config fleetd.toml cloud-check --deployment simple.local_dns --auto
//! fleetd --config fleetd.toml delete-deployment --deployment simple.local_dns
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

mod commands;
mod config;
mod director;

use commands::cloud_check::Mode;
use config::DirectorConfig;
use director::Director;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleet=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet director", version)]
struct Cli {
    /// Director config file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge a deployment to a plan.
    Deploy {
        /// Deployment plan (TOML).
        #[arg(short, long)]
        manifest: PathBuf,
        /// Replace every VM, not only the ones that need it.
        #[arg(long)]
        recreate: bool,
    },
    /// Tear a deployment down.
    DeleteDeployment {
        #[arg(short, long)]
        deployment: String,
    },
    /// Find and resolve drift between the inventory and the cloud.
    CloudCheck {
        #[arg(short, long)]
        deployment: String,
        /// Apply default resolutions without asking.
        #[arg(long, conflicts_with = "report")]
        auto: bool,
        /// Only list problems.
        #[arg(long)]
        report: bool,
    },
    /// List a deployment's instances.
    Instances {
        #[arg(short, long)]
        deployment: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = DirectorConfig::load(cli.config.as_deref())?;
    debug!(?config, "director config loaded");
    let director = Director::open(config)?;

    match cli.command {
        Command::Deploy { manifest, recreate } => {
            commands::deploy::deploy(&director, &manifest, recreate).await
        }
        Command::DeleteDeployment { deployment } => {
            commands::delete::delete_deployment(&director, &deployment).await
        }
        Command::CloudCheck {
            deployment,
            auto,
            report,
        } => {
            let mode = if auto {
                Mode::Auto
            } else if report {
                Mode::Report
            } else {
                Mode::Interactive
            };
            commands::cloud_check::cloud_check(&director, &deployment, mode).await
        }
        Command::Instances { deployment } => commands::instances::instances(&director, &deployment),
    }
}
