//! # Sensor Client
//!
//! A sensor node of the alarm fabric. It polls its configured sensors,
//! reports alerts and state changes to the alarm server over a persistent TLS
//! session and keeps that session alive through reconnects.
//!
//! ## Tasks
//! - **Watchdog**: opens the session and rebuilds it whenever it drops.
//! - **Executer**: polls the sensors while connected and queues outbound events.
//! - **Send pool**: delivers queued events and awaits their acknowledgments.
//!
//! On SIGINT/SIGTERM the loops stop, the engine flushes the frames already
//! queued and the process exits within ten seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{info, warn};

use client_logic::{build_sensors, load_config, Cli, ClientConfig};
use lib_common::configs::ClientType;
use lib_common::connection::{AckOnlyHandler, ConnectionWatchdog, SendPool, ServerCommunication, TlsServerConnector};
use lib_common::loggers::setup_logging;
use lib_common::sensors::{SensorExecuter, SensorPoller};

const APP_NAME: &str = "sensor_client";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = load_config(Cli::parse(), ClientType::Sensor, "sensor_client.json")?;
    let _log_guard =
        setup_logging(&config.log_dir, &config.log_level, APP_NAME).context("failed to initialize logging")?;
    info!(settings = ?config.connection, sensors = config.sensors.len(), "Starting sensor client");

    let shutdown = Shutdown::default();
    let node = SensorNode::start(&config)?;
    shutdown.spawn_task_fn(move |guard| node.run(guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }
    info!("Bye!");
    Ok(())
}

/// Everything a running sensor node consists of.
struct SensorNode {
    comm: Arc<ServerCommunication>,
    pool: Arc<SendPool>,
    executer: SensorExecuter,
    watchdog: ConnectionWatchdog,
}

impl SensorNode {
    /// Initializes the sensors and wires them to the connection engine.
    /// Must run inside the runtime: the send workers start immediately.
    fn start(config: &ClientConfig) -> Result<Self> {
        let sensors = build_sensors(&config.sensors).context("sensor initialization failed")?;
        if sensors.is_empty() {
            bail!("no sensors configured");
        }

        let timings = &config.connection.timings;
        let poller = SensorPoller::new(sensors, timings.full_state_interval());
        let connector = TlsServerConnector::from_settings(&config.connection).context("invalid TLS setup")?;
        let comm =
            ServerCommunication::new(config.connection.clone(), Arc::new(connector), poller.board(), Arc::new(AckOnlyHandler));

        let pool = Arc::new(SendPool::spawn(comm.clone(), timings.sender_workers, timings.sender_queue_capacity));
        let executer = SensorExecuter::new(poller, comm.clone(), pool.clone());
        let watchdog = ConnectionWatchdog::new(comm.clone());
        Ok(Self { comm, pool, executer, watchdog })
    }

    async fn run(self, guard: ShutdownGuard) {
        let Self { comm, pool, executer, watchdog } = self;
        tokio::select! {
            _ = guard.cancelled() => info!("Signal received: initiate graceful shutdown"),
            _ = watchdog.run() => {}
            _ = executer.run() => {}
        }
        pool.abort();
        comm.shutdown().await;
    }
}
