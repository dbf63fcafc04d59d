//! siltd — the Silt control-plane daemon.
//!
//! Boots the whole control plane in one process: the turf supervisor
//! client, the profile registry, the snapshot, the worker launcher, the
//! capacity manager and the state reconciler, plus the background
//! listeners that feed them.
//!
//! # Usage
//!
//! ```text
//! siltd run --config /etc/silt/silt.toml --profiles /etc/silt/profiles.json
//! siltd check-config --config /etc/silt/silt.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use silt_autoscale::CapacityManager;
use silt_core::Config;
use silt_dataplane::DataPlaneHub;
use silt_launch::{LauncherOptions, LocalCodeManager, WorkerLauncher};
use silt_reconcile::Reconciler;
use silt_state::{ApplyMode, EventBus, FunctionProfile, ProfileRegistry, Snapshot};
use silt_supervisor::{Supervisor, TurfClient};

#[derive(Parser)]
#[command(name = "siltd", about = "Silt control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to silt.toml; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Initial function profiles (JSON array), applied before the
        /// control loops start.
        #[arg(long)]
        profiles: Option<PathBuf>,

        /// Override the turf binary path.
        #[arg(long)]
        turf_bin: Option<PathBuf>,

        /// Override the bundle base directory.
        #[arg(long)]
        bundles_dir: Option<PathBuf>,

        /// Override the sandbox log directory.
        #[arg(long)]
        logs_dir: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,siltd=debug,silt=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            profiles,
            turf_bin,
            bundles_dir,
            logs_dir,
        } => {
            let mut effective = load_config(config.as_ref())?;
            if let Some(bin) = turf_bin {
                effective.turf.bin = bin;
            }
            if let Some(dir) = bundles_dir {
                effective.turf.bundles_dir = dir;
            }
            if let Some(dir) = logs_dir {
                effective.turf.logs_dir = dir;
            }
            run(effective, profiles).await
        }
        Command::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::default()),
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = Config::from_file(&path)?;
    println!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run(config: Config, profiles_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("silt control plane starting");

    std::fs::create_dir_all(&config.turf.bundles_dir)?;
    std::fs::create_dir_all(&config.turf.logs_dir)?;

    // ── Core subsystems ────────────────────────────────────────────
    let supervisor: Arc<dyn Supervisor> = Arc::new(TurfClient::new(
        config.turf.bin.clone(),
        config.turf.graceful_exit_period(),
    ));
    info!(turf = %config.turf.bin.display(), "supervisor client initialized");

    let events = EventBus::new();
    let registry = ProfileRegistry::new(config.worker.clone());
    let hub = DataPlaneHub::new();

    // Forward every committed profile set to the data planes.
    {
        let hub = hub.clone();
        registry.set_preset_hook(Box::new(move |profiles, _mode| {
            let hub = hub.clone();
            Box::pin(async move {
                hub.set_function_profiles(&profiles).await;
                Ok::<_, anyhow::Error>(())
            })
        }));
    }

    let snapshot = Snapshot::new(registry.clone(), supervisor.clone(), events.clone());
    info!("snapshot initialized");

    let launcher = Arc::new(WorkerLauncher::new(
        snapshot.clone(),
        supervisor.clone(),
        Arc::new(LocalCodeManager::new(config.turf.bundles_dir.clone())),
        LauncherOptions::from_config(&config),
    ));
    info!(
        pool_bytes = config.virtual_memory_pool_size,
        "worker launcher initialized"
    );

    let manager = Arc::new(CapacityManager::new(
        snapshot.clone(),
        launcher,
        hub.clone(),
        supervisor.clone(),
        config.virtual_memory_pool_size,
    ));

    let reconciler = Arc::new(Reconciler::new(
        snapshot.clone(),
        supervisor.clone(),
        hub.clone(),
        config.turf.logs_dir.clone(),
    ));

    // ── Initial profiles ───────────────────────────────────────────
    if let Some(path) = profiles_path {
        let body = std::fs::read(&path)?;
        let profiles: Vec<FunctionProfile> = serde_json::from_slice(&body)?;
        let count = profiles.len();
        registry.set(profiles, ApplyMode::Wait).await?;
        info!(count, path = %path.display(), "initial profiles applied");
    }

    // ── Background tasks ───────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let interval = config.control_plane.reconcile_interval();
        let shutdown = shutdown_rx.clone();
        async move {
            reconciler.run(interval, shutdown).await;
        }
    });

    let autoscale_handle = tokio::spawn({
        let manager = manager.clone();
        let interval = config.control_plane.autoscale_interval();
        let shutdown = shutdown_rx.clone();
        async move {
            manager.run(interval, shutdown).await;
        }
    });

    let report_listener = reconciler.spawn_report_listener();
    let log_gc = reconciler.spawn_log_gc();

    info!("silt control plane running");

    // ── Shutdown ───────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconcile_handle.await;
    let _ = autoscale_handle.await;
    report_listener.abort();
    log_gc.abort();

    info!("silt control plane stopped");
    Ok(())
}
