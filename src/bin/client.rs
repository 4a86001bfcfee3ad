//! # Relay Client Binary
//!
//! Terminal front end for a [`Session`]: lines typed on stdin are sent to the
//! relay, and every broadcast received is printed on its own line.
//!
//! ```bash
//! cargo run --bin relay-client -- --username alice
//! cargo run --bin relay-client -- --config config/client.toml --port 6000
//! ```
//!
//! Type `/quit` (or close stdin) to leave.

use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use relay_chat::client::{ClientConfig, Session};
use relay_chat::common::logging::init_logger;
use relay_chat::common::messages::{Envelope, MessageType};

/// Command-line arguments for the client binary
#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay client", long_about = None)]
struct Args {
    /// Path to a client configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Name shown to other participants; prompted for when missing
    #[arg(short, long)]
    username: Option<String>,

    /// Relay host, overrides the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Relay port, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,
}

/// Text shown for an envelope: system notices are marked, everything else
/// already carries its own prefix.
fn render(envelope: &Envelope) -> String {
    match envelope.kind {
        MessageType::System => format!("System: {}", envelope.message),
        _ => envelope.message.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = args.host {
        config.client.host = host;
    }
    if let Some(port) = args.port {
        config.client.port = port;
    }
    if args.username.is_some() {
        config.client.username = args.username;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let username = match config.client.username.clone() {
        Some(name) => name,
        None => {
            print!("Enter your username: ");
            std::io::stdout().flush()?;
            lines.next_line().await?.unwrap_or_default().trim().to_string()
        }
    };
    if username.is_empty() {
        anyhow::bail!("a username is required");
    }

    let session = Session::new(&username);
    let connected = session
        .connect(
            &config.client.host,
            config.client.port,
            config.connect_timeout(),
            |text| println!("{}", text),
        )
        .await;

    if let Err(e) = connected {
        eprintln!("Could not connect to server: {}", e);
        std::process::exit(1);
    }

    println!("{}", render(&Envelope::system(&format!("Connected as {}", username))));

    loop {
        tokio::select! {
            _ = session.closed() => {
                println!("{}", render(&Envelope::system("Disconnected from server")));
                break;
            }
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                if let Err(e) = session.send(text) {
                    eprintln!("Failed to send message: {}", e);
                    break;
                }
            }
        }
    }

    session.close();
    Ok(())
}
