//! # Common Components
//!
//! Shared utilities and data structures used by both client and server components.
//!
//! ## Modules
//!
//! - [`messages`]: Envelope definitions carried inside every frame
//! - [`connection`]: Frame codec (length prefix, zlib, JSON) over async streams
//! - [`config`]: Configuration parsing utilities
//! - [`logging`]: Logger initialization shared by the binaries

pub mod messages;
pub mod connection;
pub mod config;
pub mod logging;
