//! # Connection Registry
//!
//! The server's authoritative set of connected clients.
//!
//! Every membership change and every broadcast scan happens under one
//! exclusive lock, so a fan-out always sees a consistent snapshot of the
//! registry. The same lock serializes all writes to a connection, which keeps
//! frames from interleaving on the wire. The cost is that fan-outs never run
//! concurrently: one slow recipient delays every other sender.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Identifier assigned to a connection when it joins. Ids grow monotonically,
/// so iterating the registry visits connections in join order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered connection: where it came from and how to write to it.
struct Entry<W> {
    peer: SocketAddr,
    writer: W,
}

struct Inner<W> {
    next_id: u64,
    connections: BTreeMap<ConnectionId, Entry<W>>,
}

/// Registry of live connections, generic over the write half of a connection.
pub struct ConnectionRegistry<W = OwnedWriteHalf> {
    inner: Mutex<Inner<W>>,
}

impl<W> Default for ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                connections: BTreeMap::new(),
            }),
        }
    }

    /// Add a connection and return its id.
    pub async fn register(&self, peer: SocketAddr, writer: W) -> ConnectionId {
        let mut inner = self.inner.lock().await;
        let id = ConnectionId(inner.next_id);
        inner.next_id += 1;
        inner.connections.insert(id, Entry { peer, writer });
        debug!("📝 Registered {} ({}), active clients: {}", id, peer, inner.connections.len());
        id
    }

    /// Remove a connection and close its write side.
    ///
    /// Returns `true` only for the call that actually removed it; any number
    /// of concurrent failures may race to deregister the same connection.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner.connections.remove(&id);
            if let Some(entry) = &removed {
                info!(
                    "👋 Client {} ({}) disconnected. Active clients: {}",
                    id,
                    entry.peer,
                    inner.connections.len()
                );
            }
            removed
        };

        match removed {
            Some(entry) => {
                close_writer(id, entry.writer).await;
                true
            }
            None => false,
        }
    }

    /// Write one encoded frame to every registered connection except `sender`.
    ///
    /// The whole scan runs under the registry lock. Recipients whose write
    /// fails are removed once the scan has finished.
    ///
    /// # Returns
    /// - `Some(n)`: the frame was delivered to `n` connections
    /// - `None`: `sender` is no longer registered, so nothing was relayed
    pub async fn broadcast(&self, frame: &[u8], sender: Option<ConnectionId>) -> Option<usize> {
        let mut failed = Vec::new();
        let mut delivered = 0;

        let removed: Vec<(ConnectionId, W)> = {
            let mut inner = self.inner.lock().await;

            if let Some(id) = sender {
                if !inner.connections.contains_key(&id) {
                    return None;
                }
            }

            for (id, entry) in inner.connections.iter_mut() {
                if Some(*id) == sender {
                    continue;
                }
                match write_all_flush(&mut entry.writer, frame).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("❌ Failed to send to client {} ({}): {}", id, entry.peer, e);
                        failed.push(*id);
                    }
                }
            }

            let mut removed = Vec::with_capacity(failed.len());
            for id in failed {
                if let Some(entry) = inner.connections.remove(&id) {
                    info!(
                        "👋 Client {} ({}) dropped after failed send. Active clients: {}",
                        id,
                        entry.peer,
                        inner.connections.len()
                    );
                    removed.push((id, entry.writer));
                }
            }
            removed
        };

        for (id, writer) in removed {
            close_writer(id, writer).await;
        }

        Some(delivered)
    }

    /// Remove and close every connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.connections)
        };

        let count = drained.len();
        for (id, entry) in drained {
            info!("👋 Closing client {} ({})", id, entry.peer);
            close_writer(id, entry.writer).await;
        }
        count
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn write_all_flush<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Shut down the write direction. Errors mean the peer is already gone.
async fn close_writer<W>(id: ConnectionId, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        debug!("Ignoring shutdown error for client {}: {}", id, e);
    }
}
