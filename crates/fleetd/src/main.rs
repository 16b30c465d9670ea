//! fleetd - Fleet Gateway Daemon
//!
//! Connects to the module subsystem over IPC and keeps one protocol session
//! per configured backend endpoint.
//!
//! # Usage
//!
//! ```bash
//! fleetd config/fleetd.toml
//! FLEET_IPC_HOST=10.0.0.2 fleetd --json-logs config/fleetd.toml
//! ```

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_client::{EventDispatcher, GatewayClient, GatewayConfig, TcpModuleIpc, TcpTransportFactory};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(about = "Vehicle-side gateway to the fleet-management backend")]
struct Args {
    /// Gateway configuration file (TOML)
    #[arg(default_value = "config/fleetd.toml")]
    config: String,

    /// Override the module subsystem host
    #[arg(long, env = "FLEET_IPC_HOST")]
    ipc_host: Option<String>,

    /// Override the module subsystem port
    #[arg(long, env = "FLEET_IPC_PORT")]
    ipc_port: Option<u16>,

    /// Raise the default log level
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(args: &Args) {
    let default_filter = if args.verbose {
        "fleetd=debug,fleet_client=trace,fleet_core=debug"
    } else {
        "fleetd=info,fleet_client=debug,fleet_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Request shutdown once `signal` fires
///
/// If the signal cannot be listened for, the daemon keeps running.
async fn forward_shutdown<F>(signal: F, dispatcher: EventDispatcher)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received Ctrl-C, shutting down");
            dispatcher.push_shutdown();
        }
        Err(e) => {
            error!(error = %e, "Unable to listen for Ctrl-C, shutdown by signal disabled");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting fleetd (Fleet Gateway Daemon)");

    info!("Loading config from: {}", args.config);
    let mut config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config))?;
    if let Some(host) = args.ipc_host {
        config.ipc.host = host;
    }
    if let Some(port) = args.ipc_port {
        config.ipc.port = port;
    }

    info!(
        car_id = %config.car_id,
        endpoints = config.endpoints.len(),
        ipc = %config.ipc.endpoint(),
        "Configuration loaded"
    );

    let dispatcher = EventDispatcher::new();
    let ipc = TcpModuleIpc::connect(
        config.ipc.endpoint(),
        config.ipc.request_timeout(),
        dispatcher.clone(),
    )
    .await;
    let transports = TcpTransportFactory::new(config.transport.connect_timeout());

    let mut client = GatewayClient::new(
        config,
        dispatcher.clone(),
        Arc::new(ipc),
        Arc::new(transports),
    );

    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), dispatcher.clone()));

    client.run().await;
    client.stop().await;

    info!("fleetd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_requests_shutdown() {
        let dispatcher = EventDispatcher::new();
        forward_shutdown(async { Ok(()) }, dispatcher.clone()).await;
        assert_eq!(dispatcher.try_pop(), Some(None));
    }

    #[tokio::test]
    async fn test_signal_listener_failure_keeps_running() {
        let dispatcher = EventDispatcher::new();
        let failing = async {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no signal handler",
            ))
        };
        forward_shutdown(failing, dispatcher.clone()).await;
        assert!(dispatcher.is_empty());
    }
}
