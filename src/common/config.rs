//! # Configuration Utilities
//!
//! Shared configuration parsing used by both client and server components.
//! Every configuration file is optional: all fields carry defaults, and the
//! binaries let command-line flags override whatever a file provides.

use anyhow::Result;
use serde::Deserialize;
use std::fs;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 5000;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Arguments
/// - `path`: Path to the TOML configuration file
///
/// # Returns
/// - `Ok(T)`: Successfully loaded and parsed configuration
/// - `Err`: File I/O or parsing error
///
/// # Example
/// ```ignore
/// let config: ServerConfig = load_config("config/server.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

pub(crate) fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

pub(crate) fn default_port() -> u16 {
    DEFAULT_PORT
}
