//! # Client Session
//!
//! One outbound connection to the relay, with its two workers:
//!
//! - **sender**: drains the outbound FIFO and writes one frame per envelope,
//!   so messages reach the wire in the order [`Session::send`] queued them
//! - **receiver**: reads broadcast frames and hands each message text to the
//!   callback registered at connect time
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Closed
//! ```
//!
//! A failed connect returns to `Disconnected`. `Closed` is terminal; a new
//! [`Session`] is needed to reconnect. The state lives in a `watch` channel,
//! which doubles as the cancellation signal both workers select on.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let session = Session::new("alice");
//! session
//!     .connect("localhost", 5000, DEFAULT_CONNECT_TIMEOUT, |text| println!("{}", text))
//!     .await?;
//! session.send("hi")?;
//! session.close();
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::common::connection::{read_frame, write_frame, FrameError};
use crate::common::messages::Envelope;

/// Connect timeout used when the caller has no preference.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a session is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors reported synchronously to the caller of a session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The relay refused the connection or did not answer in time.
    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// `send` was called on a session that is not connected.
    #[error("session is not running")]
    NotRunning,

    /// `connect` was called on a session that already connected or closed.
    #[error("cannot connect a session that is {0}")]
    InvalidState(SessionState),
}

struct Inner {
    username: String,
    state: watch::Sender<SessionState>,
    outbound: OnceLock<mpsc::UnboundedSender<Envelope>>,
}

/// Handle to a client session. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a disconnected session for `username`.
    pub fn new(username: &str) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                username: username.to_string(),
                state,
                outbound: OnceLock::new(),
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Open the connection and start the sender and receiver workers.
    ///
    /// `on_message` is called once per received broadcast with the message
    /// text only; the relay has already prefixed it with time and sender.
    ///
    /// # Errors
    /// - [`SessionError::ConnectFailed`]: refused or timed out; the session
    ///   stays `Disconnected` and may try again
    /// - [`SessionError::InvalidState`]: the session is not `Disconnected`
    pub async fn connect<F>(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_message: F,
    ) -> Result<(), SessionError>
    where
        F: Fn(String) + Send + 'static,
    {
        self.transition(SessionState::Disconnected, SessionState::Connecting)?;

        let address = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(address, e.to_string())),
            Err(_) => return Err(self.connect_failed(address, format!("timed out after {:?}", timeout))),
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("⚠️  Could not disable Nagle on connection to {}: {}", address, e);
        }

        // close() may have run while the connect was in flight.
        self.transition(SessionState::Connecting, SessionState::Connected)?;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.outbound.set(tx).is_err() {
            // Only one connect can get past the Disconnected check.
            error!("Outbound queue already initialized for {}", self.inner.username);
            self.close();
            return Err(SessionError::NotRunning);
        }

        tokio::spawn(sender_loop(writer, rx, self.clone()));
        tokio::spawn(receiver_loop(reader, on_message, self.clone()));

        info!("✅ {} connected to {}", self.inner.username, address);
        Ok(())
    }

    /// Queue `text` for delivery. Never waits on the network.
    ///
    /// Delivery is fire-and-forget: a successful return only means the message
    /// was queued. A message whose compressed frame would exceed
    /// [`MAX_FRAME_SIZE`](crate::common::connection::MAX_FRAME_SIZE) is logged
    /// and dropped by the sender worker, and the session stays connected.
    ///
    /// # Errors
    /// [`SessionError::NotRunning`] if the session is not `Connected`.
    pub fn send(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotRunning);
        }

        let outbound = self.inner.outbound.get().ok_or(SessionError::NotRunning)?;
        outbound
            .send(Envelope::chat(&self.inner.username, text))
            .map_err(|_| SessionError::NotRunning)
    }

    /// Stop both workers and close the connection.
    ///
    /// Idempotent and callable from any thread or task. Queued messages that
    /// have not been written yet are discarded. The workers release the
    /// socket halves within one scheduling step of observing the signal.
    pub fn close(&self) {
        let started = self.inner.state.send_if_modified(|state| match state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        });

        if started {
            debug!("Closing session for {}", self.inner.username);
            self.inner.state.send_replace(SessionState::Closed);
        }
    }

    /// Resolves once the session is `Closed`, whoever closed it.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Move from `from` to `to`, or report the state that prevented it.
    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        let mut current = from;
        let moved = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if moved {
            Ok(())
        } else {
            Err(SessionError::InvalidState(current))
        }
    }

    fn connect_failed(&self, address: String, reason: String) -> SessionError {
        error!("❌ Connection to {} failed: {}", address, reason);
        // Back to Disconnected unless close() won the race.
        let _ = self.transition(SessionState::Connecting, SessionState::Disconnected);
        SessionError::ConnectFailed { address, reason }
    }

    fn stop_signal(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }
}

/// Resolves once the session starts closing.
async fn closing(state: &mut watch::Receiver<SessionState>) {
    let _ = state
        .wait_for(|s| matches!(s, SessionState::Closing | SessionState::Closed))
        .await;
}

/// Write queued envelopes in FIFO order. The write half is owned by this task
/// alone, so frames can never interleave.
async fn sender_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    session: Session,
) {
    let mut stop = session.stop_signal();

    loop {
        let envelope = tokio::select! {
            biased;
            _ = closing(&mut stop) => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = closing(&mut stop) => break,
            written = write_frame(&mut writer, &envelope) => written,
        };

        match written {
            Ok(()) => {}
            Err(FrameError::TooLarge { length, max }) => {
                warn!("⚠️  Dropping message of {} compressed bytes (max: {})", length, max);
            }
            Err(e) => {
                error!("❌ Send error: {}", e);
                session.close();
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Ignoring shutdown error: {}", e);
    }
}

/// Read broadcasts until the stream ends or the session closes.
async fn receiver_loop<F>(mut reader: OwnedReadHalf, on_message: F, session: Session)
where
    F: Fn(String) + Send + 'static,
{
    let mut stop = session.stop_signal();

    loop {
        tokio::select! {
            biased;
            _ = closing(&mut stop) => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(envelope)) => on_message(envelope.message),
                Ok(None) => {
                    info!("🔌 Server closed the connection");
                    break;
                }
                Err(e) => {
                    error!("❌ Connection lost: {}", e);
                    break;
                }
            },
        }
    }

    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_new_session_is_disconnected() {
        let session = Session::new("alice");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.username(), "alice");
    }

    #[test]
    fn test_send_before_connect_fails() {
        let session = Session::new("alice");
        assert!(matches!(session.send("hi"), Err(SessionError::NotRunning)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = Session::new("alice");
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.send("hi"), Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_connect_refused_stays_disconnected() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let session = Session::new("alice");
        let result = session
            .connect("127.0.0.1", port, Duration::from_secs(1), |_| {})
            .await;

        assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_session_cannot_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new("alice");
        session.close();
        let result = session.connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {}).await;
        assert!(matches!(result, Err(SessionError::InvalidState(SessionState::Closed))));
    }

    #[tokio::test]
    async fn test_sends_arrive_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new("alice");
        session
            .connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {})
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let (mut socket, _) = listener.accept().await.unwrap();
        for text in ["m1", "m2", "m3"] {
            session.send(text).unwrap();
        }

        for expected in ["m1", "m2", "m3"] {
            let envelope = read_frame(&mut socket).await.unwrap().unwrap();
            assert_eq!(envelope.message, expected);
            assert_eq!(envelope.username.as_deref(), Some("alice"));
        }

        session.close();
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new("alice");
        session.connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {}).await.unwrap();
        let again = session.connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {}).await;
        assert!(matches!(again, Err(SessionError::InvalidState(SessionState::Connected))));
        session.close();
    }

    #[tokio::test]
    async fn test_oversized_message_dropped_session_survives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new("alice");
        session.connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {}).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        // About 2 MiB of pseudo-random text barely compresses.
        let mut seed: u32 = 0x1234_5678;
        let huge: String = (0..2 * 1_048_576)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                char::from(b'!' + ((seed >> 16) % 90) as u8)
            })
            .collect();

        session.send(&huge).unwrap();
        session.send("after").unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut socket))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message, "after");
        assert_eq!(session.state(), SessionState::Connected);

        session.close();
    }

    #[tokio::test]
    async fn test_corrupt_frame_from_server_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::new("alice");
        session
            .connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, move |text| {
                let _ = tx.send(text);
            })
            .await
            .unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        write_frame(&mut socket, &Envelope::broadcast("[1] x: y".to_string()))
            .await
            .unwrap();
        socket.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
        socket.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let mut received = Vec::new();
        while let Ok(text) = rx.try_recv() {
            received.push(text);
        }
        assert_eq!(received, vec!["[1] x: y".to_string()]);

        // Our end is still open, so the close came from the bad frame.
        drop(socket);
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new("alice");
        session.connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, |_| {}).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.send("late"), Err(SessionError::NotRunning)));
    }
}
