//! # Broadcast Server
//!
//! Accepts client connections, registers them in the
//! [`ConnectionRegistry`], and relays every inbound message to all other
//! registered clients.
//!
//! ## Tasks
//!
//! ```text
//! accept loop ──accept──> register ──spawn──> handler (one per connection)
//! handler: read_frame -> fan_out(envelope, self) -> repeat
//!          on end-of-stream / frame error -> deregister
//! ```
//!
//! Shutdown is cooperative: a watch flag is flipped, every registered
//! connection is closed, and the accept loop drops the listening socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::registry::{ConnectionId, ConnectionRegistry};
use crate::common::connection::{encode, read_frame, FrameError};
use crate::common::messages::Envelope;

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a running relay.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops
/// the accept loop, but leaves already accepted connections to run until
/// their peers disconnect.
pub struct BroadcastServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

impl BroadcastServer {
    /// Bind to `address` and start accepting connections in the background.
    ///
    /// # Example
    /// ```ignore
    /// let server = BroadcastServer::start("localhost:5000").await?;
    /// tokio::signal::ctrl_c().await?;
    /// server.shutdown().await;
    /// ```
    pub async fn start(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind to {}", address))?;
        let local_addr = listener.local_addr()?;

        info!("📡 Server started on {}", local_addr);

        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, registry.clone(), shutdown_rx, stopped_tx));

        Ok(Self {
            local_addr,
            registry,
            shutdown_tx,
            stopped_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently registered connections.
    pub async fn active_connections(&self) -> usize {
        self.registry.len().await
    }

    /// Relay `envelope` to every registered connection except `sender`.
    ///
    /// Returns the number of connections reached; zero when `sender` is no
    /// longer registered.
    pub async fn broadcast(&self, envelope: &Envelope, sender: Option<ConnectionId>) -> Result<usize, FrameError> {
        Ok(fan_out(&self.registry, envelope, sender).await?.unwrap_or(0))
    }

    /// Stop accepting, close every registered connection, then close the
    /// listening socket. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            self.stopped().await;
            return;
        }

        info!("🛑 Shutting down server on {}", self.local_addr);
        let closed = self.registry.close_all().await;
        debug!("Closed {} client connection(s)", closed);
        self.stopped().await;
        info!("✅ Server on {} stopped", self.local_addr);
    }

    /// Resolves once the accept loop has exited and the listener is closed.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped_rx.clone();
        // An error means the accept loop is gone, which is what we wait for.
        let _ = stopped.wait_for(|done| *done).await;
    }
}

/// Resolves when the shutdown flag is set or its sender is dropped.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
) {
    let listening = &listener;
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            (socket, peer) = accept_with_backoff(move || listening.accept()) => {
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("⚠️  Could not disable Nagle for {}: {}", peer, e);
                }
                info!("🔗 New connection from {}", peer);

                let (reader, writer) = socket.into_split();
                let id = registry.register(peer, writer).await;
                tokio::spawn(handle_connection(id, reader, registry.clone(), shutdown.clone()));
            }
        }
    }

    drop(listener);
    debug!("Listener closed");
    let _ = stopped.send(true);
}

/// Retry `accept` until it yields a connection, sleeping [`ACCEPT_BACKOFF`]
/// after every error.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("❌ Error accepting client connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Read frames from one client and relay them until the stream ends.
///
/// Deregistration at the end is the only way a connection leaves the
/// registry through its own handler.
async fn handle_connection(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(envelope)) => match fan_out(&registry, &envelope, Some(id)).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!("Client {} was removed from the registry, closing", id);
                        break;
                    }
                    Err(e) => {
                        warn!("❌ Dropping client {}: {}", id, e);
                        break;
                    }
                },
                Ok(None) => {
                    debug!("🔌 Client {} closed the connection", id);
                    break;
                }
                Err(e) => {
                    warn!("❌ Receive error from client {}: {}", id, e);
                    break;
                }
            },
        }
    }

    registry.deregister(id).await;
}

/// Format `envelope` for display and write it to everyone but `sender`.
///
/// Fails with [`FrameError::Corrupt`] when the envelope has no sender fields
/// to render. Returns `Ok(None)` without relaying when `sender` has already
/// been removed from the registry.
async fn fan_out(
    registry: &ConnectionRegistry,
    envelope: &Envelope,
    sender: Option<ConnectionId>,
) -> Result<Option<usize>, FrameError> {
    let line = envelope
        .display_line()
        .ok_or_else(|| FrameError::Corrupt("envelope has no timestamp or username".to_string()))?;

    let frame = encode(&Envelope::broadcast(line))?;
    let delivered = registry.broadcast(&frame, sender).await;
    if let Some(count) = delivered {
        debug!("📤 Relayed message from {:?} to {} client(s)", sender, count);
    }
    Ok(delivered)
}
