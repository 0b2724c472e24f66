//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles the update server:
//! - State store (redb)
//! - Deployment manager (actions + device feedback)
//! - Rollout executor + housekeeping loop
//! - Forced-time escalation loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd serve --port 8080 --data-dir /var/lib/fleetgrid
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use fleetgrid_deploy::DeploymentManager;
use fleetgrid_state::{Clock, SystemClock};

use crate::config::FleetdConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid update server daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update server (REST API + rollout housekeeping).
    Serve {
        /// Path to a fleetd.toml config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on. Overrides the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state. Overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Housekeeping interval in seconds. Overrides the config file.
        #[arg(long)]
        housekeeping_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            housekeeping_interval,
        } => {
            let mut cfg = match config {
                Some(path) => FleetdConfig::from_file(&path)?,
                None => FleetdConfig::default(),
            };
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            if let Some(secs) = housekeeping_interval {
                cfg.housekeeping_interval_secs = secs;
            }
            serve(cfg).await
        }
    }
}

async fn serve(config: FleetdConfig) -> anyhow::Result<()> {
    info!("FleetGrid update server starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = fleetgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Deployment manager.
    let deploy = DeploymentManager::new(store.clone(), clock.clone());
    info!("deployment manager initialized");

    // Rollout executor.
    let executor = Arc::new(fleetgrid_rollout::RolloutExecutor::new(
        store.clone(),
        deploy.clone(),
        clock.clone(),
        config.executor_config(),
    ));
    info!(
        interval = config.housekeeping_interval_secs,
        max_groups = config.max_groups,
        "rollout executor initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping_shutdown = shutdown_rx.clone();
    let escalation_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let interval = Duration::from_secs(config.housekeeping_interval_secs);

    // Rollout housekeeping loop.
    let housekeeping_executor = executor.clone();
    let housekeeping_handle = tokio::spawn(async move {
        housekeeping_executor
            .run(interval, housekeeping_shutdown)
            .await;
    });

    // Forced-time escalation loop, same cadence as housekeeping.
    let escalation_deploy = deploy.clone();
    let escalation_handle = tokio::spawn(async move {
        run_escalation(escalation_deploy, interval, escalation_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = fleetgrid_api::build_router(fleetgrid_api::ApiState {
        store,
        deploy,
        executor,
        clock,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = housekeeping_handle.await;
    let _ = escalation_handle.await;

    info!("FleetGrid update server stopped");
    Ok(())
}

/// Escalates overdue time-forced actions until shutdown.
async fn run_escalation(
    deploy: DeploymentManager,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match deploy.force_overdue_actions() {
                    Ok(0) => {}
                    Ok(n) => info!(escalated = n, "time-forced actions escalated"),
                    Err(err) => warn!(%err, "forced-time escalation failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("escalation loop shutting down");
                    break;
                }
            }
        }
    }
}
