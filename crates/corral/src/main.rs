use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corral::capture::{BackendRegistry, CaptureSupervisor, SessionSet};
use corral::convert::{Converter, RemuxBackend};
use corral::roster::RosterClient;
use corral::store::InclusionStore;
use corral::supervisor::{RequestQueue, Snapshot, Supervisor};
use corral::web;
use corralconf::CorralConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// The Corral capture supervisor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file path (overrides the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the control API (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the completed directory and remux finished captures into mp4
    Convert,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        CorralConfig::load_from(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.bind.http_port = port;
    }

    corral::telemetry::init(&config.telemetry.log_level)
        .context("Failed to initialize logging")?;

    if let Some(Command::Convert) = cli.command {
        return run_convert(config).await;
    }

    std::fs::create_dir_all(&config.paths.capture_dir)
        .context("Failed to create capture directory")?;
    std::fs::create_dir_all(&config.paths.complete_dir)
        .context("Failed to create complete directory")?;
    tracing::info!(
        capture_dir = %config.paths.capture_dir.display(),
        complete_dir = %config.paths.complete_dir.display(),
        "Output directories ready"
    );

    let (store, persisted_queue) = InclusionStore::load(&config.paths.state_file)
        .with_context(|| {
            format!(
                "Failed to load state file {}",
                config.paths.state_file.display()
            )
        })?;
    tracing::info!(
        entries = store.len(),
        queued = persisted_queue.len(),
        state_file = %config.paths.state_file.display(),
        "Inclusion state loaded"
    );

    let queue = RequestQueue::seed(persisted_queue);
    let snapshot = Snapshot::new();
    let sessions = SessionSet::new();

    let fetcher = Arc::new(RosterClient::new(&config.roster)?);
    let captures = CaptureSupervisor::new(&config, sessions.clone(), BackendRegistry::default());

    let shutdown = CancellationToken::new();

    // Control API
    let web_state = web::WebState {
        queue: queue.clone(),
        snapshot: snapshot.clone(),
        sessions,
        started: Instant::now(),
    };
    let app = web::router(web_state);

    let addr = format!("0.0.0.0:{}", config.bind.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Control API listening on http://{addr}");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });
    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Control API shutdown with error: {e:?}");
        }
    });

    // Supervisor loop
    let supervisor = Supervisor::new(config, fetcher, captures, store, queue, snapshot);
    let loop_shutdown = shutdown.clone();
    let mut supervisor_handle = tokio::spawn(supervisor.run(loop_shutdown));

    tokio::select! {
        result = &mut supervisor_handle => {
            // Startup-fatal path: no roster within the startup window.
            shutdown.cancel();
            return result.context("Supervisor task panicked")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal, shutting down gracefully...");
            shutdown.cancel();
        }
    }

    supervisor_handle.await.context("Supervisor task panicked")??;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Run the post-capture conversion loop instead of the supervisor.
async fn run_convert(config: CorralConfig) -> Result<()> {
    std::fs::create_dir_all(&config.convert.src_dir)
        .context("Failed to create conversion source directory")?;
    std::fs::create_dir_all(&config.convert.dst_dir)
        .context("Failed to create conversion destination directory")?;
    tracing::info!(
        src_dir = %config.convert.src_dir.display(),
        dst_dir = %config.convert.dst_dir.display(),
        "Conversion directories ready"
    );

    let scan_interval = Duration::from_secs(config.convert.scan_interval_secs);
    let converter = Converter::new(&config, Box::new(RemuxBackend));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(converter.run(scan_interval, shutdown.clone()));

    shutdown_signal().await;
    tracing::info!("Received shutdown signal, shutting down gracefully...");
    shutdown.cancel();
    handle.await.context("Converter task panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM (systemd etc.)
async fn shutdown_signal() {
    let sigterm = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
            sigterm.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm => {}
    }
}
