//! Configuration handling for the relay service.
//!
//! Reads the YAML configuration file and environment variables, providing
//! a unified configuration interface. Command-line flags override both.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Relay service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Stable server identifier sent in WELCOME
    pub server_id: String,
    /// Host to bind the listener to
    pub listen_host: String,
    /// Port to bind the listener to
    pub listen_port: u16,
    /// Human-readable banner sent in WELCOME
    pub banner: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_id: "searelay-1".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9000,
            banner: "searelay maritime relay".to_string(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    relay: Option<RelaySection>,
}

#[derive(Debug, Deserialize)]
struct RelaySection {
    server_id: Option<String>,
    listen_host: Option<String>,
    listen_port: Option<u16>,
    banner: Option<String>,
}

impl RelayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "Failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            "Final relay configuration: server_id={}, listen={}:{}",
            config.server_id, config.listen_host, config.listen_port
        );

        Ok(config)
    }

    /// Socket address to bind the listener to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(relay) = root_config.relay {
            if let Some(server_id) = relay.server_id {
                self.server_id = server_id;
            }
            if let Some(listen_host) = relay.listen_host {
                self.listen_host = listen_host;
            }
            if let Some(listen_port) = relay.listen_port {
                self.listen_port = listen_port;
            }
            if let Some(banner) = relay.banner {
                self.banner = banner;
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(server_id) = std::env::var("SEARELAY_SERVER_ID") {
            self.server_id = server_id;
            info!("Server id overridden by environment: {}", self.server_id);
        }

        if let Ok(listen_host) = std::env::var("SEARELAY_LISTEN_HOST") {
            self.listen_host = listen_host;
            info!("Listen host overridden by environment: {}", self.listen_host);
        }

        if let Ok(listen_port) = std::env::var("SEARELAY_LISTEN_PORT") {
            if let Ok(port) = listen_port.parse::<u16>() {
                self.listen_port = port;
                info!("Listen port overridden by environment: {}", port);
            }
        }

        if let Ok(banner) = std::env::var("SEARELAY_BANNER") {
            self.banner = banner;
        }
    }
}
