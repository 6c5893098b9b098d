//! Maritime relay server binary.
//!
//! Boots one relay server instance: loads the YAML configuration with
//! environment and command-line overrides, wires the component graph
//! (position tracker, service directory, target registry, broadcast
//! router), and serves until interrupted.

use clap::Parser;
use relay_server::{
    BroadcastRouter, PositionTracker, RelayServer, ServerConfig, ServiceDirectory, TargetRegistry,
};
use relay_session::listen_tcp;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::RelayConfig;
use logging::RelayLogFormatter;

/// Maritime peer-messaging relay server
#[derive(Parser, Debug)]
#[command(name = "searelay", version, about = "Maritime peer-messaging relay server")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:9000 (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Stable server identifier sent in WELCOME (overrides the config file)
    #[arg(long)]
    server_id: Option<String>,

    /// Path to the YAML configuration file
    #[arg(long, default_value = "searelay.yaml")]
    config: PathBuf,

    /// Handshake timeout, e.g. 10s
    #[arg(long, default_value = "10s")]
    handshake_timeout: humantime::Duration,

    /// End-to-end service invocation timeout, e.g. 30s
    #[arg(long, default_value = "30s")]
    invoke_timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(RelayLogFormatter::new("searelay".to_string()))
        .init();

    let mut config = RelayConfig::load_from_file(&args.config)?;
    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    let listen_addr = match args.listen {
        Some(addr) => addr,
        None => config.listen_addr()?,
    };

    // Component graph, wired explicitly: one of everything per server
    let registry = Arc::new(TargetRegistry::new());
    let tracker = Arc::new(PositionTracker::new());
    let directory = Arc::new(ServiceDirectory::new(registry.clone(), tracker.clone()));
    let router = Arc::new(BroadcastRouter::new(registry.clone(), tracker.clone()));
    let server = RelayServer::new(
        ServerConfig {
            server_id: config.server_id.clone(),
            banner: config.banner.clone(),
            handshake_timeout: args.handshake_timeout.into(),
            invoke_timeout: args.invoke_timeout.into(),
        },
        registry,
        tracker,
        directory,
        router,
    );

    let listener = listen_tcp(listen_addr).await?;
    component_info!("server", "relay {} listening on {}", config.server_id, listen_addr);

    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
