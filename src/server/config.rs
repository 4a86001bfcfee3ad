use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::config::{default_host, default_port, load_config};

/// Complete server configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Where this server listens
    #[serde(default)]
    pub server: ServerInfo,
}

/// Listening endpoint of the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Load server configuration from a TOML file.
    ///
    /// # Example
    /// ```ignore
    /// let config = ServerConfig::from_file("config/server.toml")?;
    /// ```
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }

    /// `host:port` string suitable for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
