//! # Server Components
//!
//! - [`server`]: accept loop, per-connection handlers and shutdown
//! - [`registry`]: the set of live connections and the broadcast fan-out
//! - [`config`]: listening endpoint configuration

pub mod config;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::BroadcastServer;
