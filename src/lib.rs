pub mod client;
pub mod common;
pub mod server;

pub use client::Session;
pub use common::messages::{Envelope, MessageType};
pub use server::BroadcastServer;
