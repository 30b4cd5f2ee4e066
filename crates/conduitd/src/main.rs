//! conduitd: the Conduit daemon.
//!
//! Single binary that assembles the connector control plane:
//! - State store (redb)
//! - Builtin connector catalog
//! - Worker launcher + node pool
//! - One lifecycle manager per workload kind (sources, sinks, functions)
//! - Liveness sweeper
//! - Admin REST API
//!
//! # Usage
//!
//! ```text
//! conduitd standalone --port 8080 --data-dir /var/lib/conduit --config conduit.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use conduit_core::{ConnectorCatalog, DaemonSettings, WorkloadKind};
use conduit_lifecycle::{LifecycleManager, LifecycleOptions};
use conduit_state::StateStore;
use conduit_supervisor::{LocalLauncher, NodePool, WorkerLauncher};

#[derive(Parser)]
#[command(name = "conduitd", about = "Conduit connector control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single process, local workers).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/conduit")]
        data_dir: PathBuf,

        /// Optional TOML settings file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,conduitd=debug,conduit=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            config,
            log_json,
        } => {
            init_tracing(log_json);
            let settings = match config {
                Some(path) => {
                    info!(?path, "loading settings");
                    DaemonSettings::from_file(&path)?
                }
                None => DaemonSettings::default(),
            };
            run_standalone(port, data_dir, settings).await
        }
    }
}

async fn run_standalone(
    port: u16,
    data_dir: PathBuf,
    settings: DaemonSettings,
) -> anyhow::Result<()> {
    info!("Conduit daemon starting in standalone mode");
    settings.validate()?;

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("conduit.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Builtin catalog.
    let connectors_dir = settings
        .connectors_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("connectors"));
    let catalog = Arc::new(ConnectorCatalog::from_dir(&connectors_dir)?);
    info!(count = catalog.len(), dir = ?connectors_dir, "builtin catalog ready");

    // Workers.
    // The launcher must know nodes by the names the pool hands out.
    let node_pool = Arc::new(NodePool::new(settings.workers.nodes.clone())?);
    let launcher: Arc<dyn WorkerLauncher> =
        Arc::new(LocalLauncher::new(node_pool.nodes().to_vec()));
    info!(nodes = ?node_pool.nodes(), "worker launcher initialized");

    // Lifecycle managers, one per kind.
    let options = LifecycleOptions::from_settings(&settings)?;
    let managers: Vec<Arc<LifecycleManager>> = WorkloadKind::ALL
        .into_iter()
        .map(|kind| {
            Arc::new(LifecycleManager::new(
                kind,
                store.clone(),
                catalog.clone(),
                launcher.clone(),
                node_pool.clone(),
                options.clone(),
            ))
        })
        .collect();

    for manager in &managers {
        let recovered = manager.recover().await?;
        info!(kind = %manager.kind(), recovered, "lifecycle manager ready");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Liveness sweeper.
    let liveness_interval = settings.liveness_interval()?;
    let liveness_handle = tokio::spawn(run_liveness(
        managers.clone(),
        liveness_interval,
        shutdown_rx,
    ));

    // ── Start API server ───────────────────────────────────────

    let router = conduit_api::build_router(managers);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = liveness_handle.await;

    info!("Conduit daemon stopped");
    Ok(())
}

/// Periodically ask every manager to check its workers until shutdown.
async fn run_liveness(
    managers: Vec<Arc<LifecycleManager>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = ?every, "liveness sweeper started");
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately; recovery just ran.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for manager in &managers {
                    let healed = manager.sweep_liveness().await;
                    if healed > 0 {
                        info!(kind = %manager.kind(), healed, "relaunched dead instances");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("liveness sweeper shutting down");
                break;
            }
        }
    }
}
