//! Cadence Operator - drives Job resources to their desired Pod count

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadence_common::config::OperatorConfig;
use cadence_common::telemetry::init_logging;
use cadence_operator::startup::{crd_manifest, ensure_crds_installed};
use cadence_operator::Operator;

/// Cadence - reconciles Job resources into worker Pods
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    /// Print the Job CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Jobs and their Pods in `POD_NAMESPACE` until SIGINT or SIGTERM.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifest()?);
        return Ok(());
    }

    let config = OperatorConfig::from_env()?;
    init_logging(config.log_level)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(config).await,
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    ensure_crds_installed(&client).await?;

    let terminated = CancellationToken::new();
    tokio::spawn(shutdown_hook(terminated.clone()));

    let mut operator = Operator::new(client, &config);
    operator.start()?;
    info!(
        namespace = %config.namespace,
        sweep_secs = config.sweep.as_secs(),
        command_timeout_secs = config.command_timeout.as_secs(),
        "operator running"
    );

    terminated.cancelled().await;
    info!("termination signal received, shutting down");
    operator.close().await;
    Ok(())
}

/// Cancels `terminated` on SIGINT or SIGTERM
async fn shutdown_hook(terminated: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    terminated.cancel();
}
