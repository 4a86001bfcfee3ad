//! # Relay Server Binary
//!
//! ```bash
//! cargo run --bin relay-server -- --port 5000
//! cargo run --bin relay-server -- --config config/server.toml
//! ```
//!
//! Runs until Ctrl-C, then closes every client connection and the listener.

use clap::Parser;

use relay_chat::common::logging::init_logger;
use relay_chat::server::{BroadcastServer, ServerConfig};

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay server", long_about = None)]
struct Args {
    /// Path to a server configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Host to bind, overrides the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let server = BroadcastServer::start(&config.address()).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            println!("\nShutting down server...");
        }
        _ = server.stopped() => {}
    }

    server.shutdown().await;
    Ok(())
}
