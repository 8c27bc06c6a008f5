//! # Manager Client
//!
//! A manager node of the alarm fabric. It mirrors the server state (options,
//! nodes, sensors, alerts) and forwards option changes from local tools,
//! received on a Unix-domain admin socket, to the server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use client_logic::{load_config, Cli};
use lib_common::configs::ClientType;
use lib_common::connection::{ConnectionWatchdog, ServerCommunication, TlsServerConnector};
use lib_common::loggers::setup_logging;
use lib_common::manager::{LocalServer, ManagerModel, ManagerProfile};

const APP_NAME: &str = "manager_client";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = load_config(Cli::parse(), ClientType::Manager, "manager_client.json")?;
    let _log_guard =
        setup_logging(&config.log_dir, &config.log_level, APP_NAME).context("failed to initialize logging")?;
    info!(settings = ?config.connection, admin_socket = %config.admin_socket.display(), "Starting manager client");

    let model = Arc::new(ManagerModel::new());
    let profile = Arc::new(ManagerProfile { description: config.description.clone() });
    let connector = TlsServerConnector::from_settings(&config.connection).context("invalid TLS setup")?;
    let comm = ServerCommunication::new(config.connection.clone(), Arc::new(connector), profile, model);
    let admin = LocalServer::bind(&config.admin_socket, comm.clone())
        .with_context(|| format!("failed to bind admin socket {}", config.admin_socket.display()))?;

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| run(guard, comm, admin));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }
    info!("Bye!");
    Ok(())
}

async fn run(guard: ShutdownGuard, comm: Arc<ServerCommunication>, admin: LocalServer) {
    let cancel = CancellationToken::new();
    let admin = tokio::spawn(admin.run(cancel.clone()));
    let watchdog = ConnectionWatchdog::new(comm.clone());

    tokio::select! {
        _ = guard.cancelled() => info!("Signal received: initiate graceful shutdown"),
        _ = watchdog.run() => {}
    }
    cancel.cancel();
    if let Err(e) = admin.await {
        warn!("Admin socket task failed: {}", e);
    }
    comm.shutdown().await;
}
