//! Connection Handles
//!
//! A [`Connection`] is the hub's view of one live WebSocket. The socket
//! itself is owned by a reader task and a writer task (see `handler.rs`);
//! the handle only carries an id, a bounded outbound queue feeding the
//! writer task, and the lifecycle state shared by everyone holding a clone.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::messages::Message;

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Lifecycle of a connection
///
/// Transitions only move forward: `Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting outbound frames
    Open,
    /// Close requested, writer is flushing the close frame
    Closing,
    /// Writer task has exited
    Closed,
}

/// A frame queued for the writer task
#[derive(Debug)]
pub struct Outbound {
    /// Encoded wire JSON
    pub frame: Arc<str>,
    /// Reports the socket write result back to a direct sender
    pub ack: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

/// Handle for sending messages to a specific connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    outbound: mpsc::Sender<Outbound>,
    state: watch::Sender<ConnectionState>,
    write_timeout: Duration,
}

impl Connection {
    /// Create a connection handle and the receiving end of its outbound queue
    ///
    /// The receiver belongs to whatever drives the socket writes.
    pub fn new(
        remote: Option<SocketAddr>,
        outbound_capacity: usize,
        write_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(outbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Open);

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4().to_string(),
                remote,
                outbound,
                state,
                write_timeout,
            }),
        };

        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send a message and wait for the socket write to finish
    ///
    /// Both the enqueue and the write acknowledgement are bounded by the
    /// connection's write timeout.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        let frame: Arc<str> = message.encode()?.into();
        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound = Outbound {
            frame,
            ack: Some(ack_tx),
        };

        self.inner
            .outbound
            .send_timeout(outbound, self.inner.write_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ConnectionError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => ConnectionError::Closed,
            })?;

        match tokio::time::timeout(self.inner.write_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            // Writer dropped the ack, it exited before writing
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Queue an already-encoded frame without waiting
    ///
    /// Used for broadcast fan-out. A full queue means the peer is not
    /// keeping up and is reported as [`ConnectionError::Backpressure`].
    pub fn try_deliver(&self, frame: Arc<str>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        self.inner
            .outbound
            .try_send(Outbound { frame, ack: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Request the connection to close
    ///
    /// Returns `true` if this call moved the connection out of `Open`.
    pub fn close(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Mark the connection as fully closed; called by the writer task on exit
    pub fn mark_closed(&self) {
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Resolves once the connection has left the `Open` state
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait
        let _ = rx.wait_for(|state| *state != ConnectionState::Open).await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Errors writing to a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,

    #[error("Write timed out")]
    Timeout,

    #[error("Outbound queue is full")]
    Backpressure,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        Connection::new(None, capacity, Duration::from_millis(200))
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = test_connection(4);
        let (b, _rb) = test_connection(4);

        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_lifecycle_moves_forward() {
        let (conn, _rx) = test_connection(4);
        assert_eq!(conn.state(), ConnectionState::Open);

        assert!(conn.close());
        assert_eq!(conn.state(), ConnectionState::Closing);

        // Second close is not the one that initiated it
        assert!(!conn.close());

        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.close());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_try_deliver_queues_frame() {
        let (conn, mut rx) = test_connection(4);

        conn.try_deliver(Arc::from("{}")).unwrap();
        let out = rx.try_recv().unwrap();
        assert_eq!(&*out.frame, "{}");
        assert!(out.ack.is_none());
    }

    #[test]
    fn test_try_deliver_full_queue_is_backpressure() {
        let (conn, _rx) = test_connection(1);

        conn.try_deliver(Arc::from("1")).unwrap();
        let err = conn.try_deliver(Arc::from("2")).unwrap_err();
        assert!(matches!(err, ConnectionError::Backpressure));
    }

    #[test]
    fn test_try_deliver_after_close_fails() {
        let (conn, _rx) = test_connection(4);
        conn.close();

        let err = conn.try_deliver(Arc::from("{}")).unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[test]
    fn test_try_deliver_without_writer_fails() {
        let (conn, rx) = test_connection(4);
        drop(rx);

        let err = conn.try_deliver(Arc::from("{}")).unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_send_waits_for_ack() {
        let (conn, mut rx) = test_connection(4);
        let msg = Message::from_raw("echo", r#"{"data":"x"}"#).unwrap();

        let writer = tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            assert_eq!(&*out.frame, r#"{"type":"echo","payload":{"data":"x"}}"#);
            out.ack.unwrap().send(Ok(())).unwrap();
        });

        conn.send(&msg).await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reports_write_failure() {
        let (conn, mut rx) = test_connection(4);
        let msg = Message::from_raw("echo", "1").unwrap();

        tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            let _ = out
                .ack
                .unwrap()
                .send(Err(ConnectionError::Transport("broken pipe".into())));
        });

        let err = conn.send(&msg).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_times_out_without_writer_progress() {
        let (conn, _rx) = test_connection(4);
        let msg = Message::from_raw("echo", "1").unwrap();

        let err = conn.send(&msg).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
    }

    #[tokio::test]
    async fn test_send_on_closed_connection() {
        let (conn, _rx) = test_connection(4);
        conn.close();

        let msg = Message::from_raw("echo", "1").unwrap();
        assert!(matches!(
            conn.send(&msg).await.unwrap_err(),
            ConnectionError::Closed
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves_on_close() {
        let (conn, _rx) = test_connection(4);
        let waiter = conn.clone();

        let task = tokio::spawn(async move { waiter.closed().await });
        conn.close();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
