//! # Client Components
//!
//! - [`session`]: one connection to the relay with its sender and receiver workers
//! - [`config`]: identity and relay endpoint configuration
//!
//! Presentation layers (the terminal client binary, a GUI, tests) only talk
//! to [`Session`]: `connect`, `send`, `close`, and the message callback.

pub mod config;
pub mod session;

pub use config::ClientConfig;
pub use session::{Session, SessionError, SessionState, DEFAULT_CONNECT_TIMEOUT};
