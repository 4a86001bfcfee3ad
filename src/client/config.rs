use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::config::{default_host, default_port, load_config};

/// Client configuration loaded from TOML file.
///
/// # Example TOML
///
/// ```toml
/// [client]
/// username = "alice"
/// host = "localhost"
/// port = 5000
/// connect_timeout_secs = 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identity and relay endpoint
    #[serde(default)]
    pub client: ClientInfo,
}

/// Client identity and the relay it talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Display name; the client binary prompts for one when absent
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on establishing the TCP connection (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            username: None,
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Loads client configuration from a TOML file.
    ///
    /// ```rust,ignore
    /// let config = ClientConfig::from_file("config/client.toml")?;
    /// ```
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.client.connect_timeout_secs)
    }
}
