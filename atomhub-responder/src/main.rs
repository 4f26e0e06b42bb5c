//! atomhub-responder - Main entry point
//!
//! Long-running service that consumes the upload event stream, the
//! project/commission topic broker and the job-completion feed, and
//! drives imports into the storage system.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atomhub_common::config::HubConfig;
use atomhub_responder::services::resend::{ResendClient, ResendRequester};
use atomhub_responder::{bootstrap, worker};

/// Exit code for a dead consumer: distinguishes "restart me" from plain
/// startup failures for the service manager
const EXIT_CONSUMER_DEAD: i32 = 255;

#[derive(Parser, Debug)]
#[command(name = "atomhub-responder")]
#[command(about = "Media-ingest integration hub")]
#[command(version)]
struct Cli {
    /// Path of the configuration file
    #[arg(short, long, env = "ATOMHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume all streams until stopped
    Run,
    /// Ask the origin system to replay the upload event for one atom
    Resync {
        /// Atom id to replay
        atom_id: uuid::Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atomhub_responder=debug,atomhub_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config =
        HubConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Resync { atom_id } => resync(config, atom_id).await,
    }
}

async fn run(config: HubConfig) -> anyhow::Result<()> {
    info!("Starting atomhub responder");
    let app = bootstrap::build(&config)
        .await
        .context("Failed to assemble service")?;

    // event side-channel goes to the log in this deployment shape
    let mut events = app.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!("Event: {:?}", event);
        }
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    if let Err(e) = worker::run_consumers(app.sources, app.router, shutdown.clone()).await {
        error!("Consumer set failed: {}", e);
        std::process::exit(EXIT_CONSUMER_DEAD);
    }

    info!("atomhub responder stopped");
    Ok(())
}

async fn resync(config: HubConfig, atom_id: uuid::Uuid) -> anyhow::Result<()> {
    let client = ResendClient::new(&config.origin.host, &config.origin.shared_secret);
    client
        .request_resend(&atom_id.to_string())
        .await
        .with_context(|| format!("Resend request for atom {} failed", atom_id))?;
    info!("Requested resend for atom {}", atom_id);
    Ok(())
}
