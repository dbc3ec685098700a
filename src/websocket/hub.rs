//! WebSocket Connection Hub
//!
//! Owns the set of live connections. Every mutation of that set, and every
//! broadcast fan-out, runs inside one coordinator task; the rest of the
//! program talks to it through a bounded command queue. Nothing else ever
//! touches the registry, so register, unregister and broadcast are applied
//! in a single serial order without per-entry locking.
//!
//! A copy of the registry is published on a `watch` channel after each
//! change so [`Hub::clients`] can answer without a round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::connection::{Connection, ConnectionError, ConnectionId};
use super::dispatch::{HandlerRegistry, MessageHandler};
use super::messages::Message;

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Capacity of the coordinator's command queue
    pub command_capacity: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
    /// Upper bound for a single socket write
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            command_capacity: 256,
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Requests handled by the coordinator task
enum HubCommand {
    Register {
        conn: Connection,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        frame: Arc<str>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the hub
///
/// All clones talk to the same coordinator task.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    commands: mpsc::Sender<HubCommand>,
    clients: watch::Receiver<Arc<Vec<Connection>>>,
    handlers: HandlerRegistry,
    config: HubConfig,
    /// Coordinator waiting for `start`; `None` once spawned
    pending: Mutex<Option<Coordinator>>,
    started: AtomicBool,
}

impl Hub {
    /// Create a hub without starting its coordinator
    ///
    /// Commands submitted before [`Hub::start`] wait in the queue.
    pub fn new(config: HubConfig) -> Self {
        let (commands, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (clients_tx, clients) = watch::channel(Arc::new(Vec::new()));

        let coordinator = Coordinator {
            commands: commands_rx,
            clients: HashMap::new(),
            published: clients_tx,
            max_connections: config.max_connections,
        };

        Self {
            inner: Arc::new(HubInner {
                commands,
                clients,
                handlers: HandlerRegistry::new(),
                config,
                pending: Mutex::new(Some(coordinator)),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Create a hub and start its coordinator immediately
    pub fn spawn(config: HubConfig) -> Self {
        let hub = Self::new(config);
        hub.start();
        hub
    }

    /// Start the coordinator task if it is not already running
    ///
    /// Returns `true` if this call started it. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> bool {
        let coordinator = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match coordinator {
            Some(coordinator) => {
                self.inner.started.store(true, Ordering::SeqCst);
                tokio::spawn(coordinator.run());
                tracing::debug!("Hub coordinator started");
                true
            }
            None => false,
        }
    }

    /// Whether the coordinator is running and accepting commands
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.commands.is_closed()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Add a connection to the registry
    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Register { conn, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Remove a connection from the registry and close it
    ///
    /// Returns whether the connection was registered; unknown ids are a
    /// no-op.
    pub async fn unregister(&self, id: &str) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Unregister {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Deliver a message to every registered connection
    ///
    /// The message is encoded once here; the coordinator fans the frame
    /// out against the registry as it stands when the command is processed.
    pub async fn broadcast(&self, message: &Message) -> Result<(), HubError> {
        let frame: Arc<str> = message.encode()?.into();
        self.submit(HubCommand::Broadcast { frame }).await
    }

    /// Send a message to a single connection, bypassing the registry
    pub async fn send(&self, conn: &Connection, message: &Message) -> Result<(), ConnectionError> {
        conn.send(message).await
    }

    /// Snapshot of the registered connections
    ///
    /// The snapshot is not kept up to date; connections in it may be
    /// unregistered by the time the caller looks at them.
    pub fn clients(&self) -> Vec<Connection> {
        self.inner.clients.borrow().as_ref().clone()
    }

    /// Get the current connection count
    pub fn connection_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    /// Register a handler for a message type, replacing any previous one
    pub fn register_handler(&self, kind: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.inner.handlers.register(kind, handler);
    }

    /// Remove the handler for a message type
    ///
    /// Later messages of that type fall back to broadcast. Returns whether
    /// a handler was registered.
    pub fn remove_handler(&self, kind: &str) -> bool {
        self.inner.handlers.remove(kind)
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Close every connection and stop the coordinator
    ///
    /// Returns the number of connections that were closed. Calling this a
    /// second time returns [`HubError::Closed`].
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        // A coordinator that never ran has nothing registered; drop it so
        // queued and future commands fail with `Closed`.
        let never_started = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(coordinator) = never_started {
            self.inner.started.store(true, Ordering::SeqCst);
            drop(coordinator);
            return Ok(0);
        }

        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// Sole owner of the connection registry
struct Coordinator {
    commands: mpsc::Receiver<HubCommand>,
    clients: HashMap<ConnectionId, Connection>,
    published: watch::Sender<Arc<Vec<Connection>>>,
    max_connections: usize,
}

impl Coordinator {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register { conn, reply } => {
                    let result = self.register(conn);
                    let _ = reply.send(result);
                }
                HubCommand::Unregister { id, reply } => {
                    let removed = self.unregister(&id);
                    let _ = reply.send(removed);
                }
                HubCommand::Broadcast { frame } => self.broadcast(frame),
                HubCommand::Shutdown { reply } => {
                    // Refuse new commands before reporting back
                    self.commands.close();
                    let closed = self.close_all();
                    let _ = reply.send(closed);
                    break;
                }
            }
        }

        // Every `Hub` handle was dropped, or shutdown was requested
        self.commands.close();
        self.close_all();
        tracing::debug!("Hub coordinator stopped");
    }

    fn register(&mut self, conn: Connection) -> Result<(), HubError> {
        if self.clients.contains_key(conn.id()) {
            tracing::warn!(connection_id = %conn.id(), "Connection registered twice");
            return Err(HubError::AlreadyRegistered(conn.id().to_string()));
        }
        if self.clients.len() >= self.max_connections {
            return Err(HubError::TooManyConnections(self.max_connections));
        }

        tracing::info!(
            connection_id = %conn.id(),
            remote = ?conn.remote_addr(),
            total = self.clients.len() + 1,
            "WebSocket connected"
        );
        self.clients.insert(conn.id().to_string(), conn);
        self.publish();
        Ok(())
    }

    fn unregister(&mut self, id: &str) -> bool {
        match self.clients.remove(id) {
            Some(conn) => {
                conn.close();
                tracing::info!(
                    connection_id = %id,
                    total = self.clients.len(),
                    "WebSocket disconnected"
                );
                self.publish();
                true
            }
            None => false,
        }
    }

    fn broadcast(&mut self, frame: Arc<str>) {
        let mut failed = Vec::new();

        for (id, conn) in &self.clients {
            if let Err(e) = conn.try_deliver(Arc::clone(&frame)) {
                tracing::warn!(connection_id = %id, error = %e, "Dropping connection after failed broadcast");
                failed.push(id.clone());
            }
        }

        for id in &failed {
            if let Some(conn) = self.clients.remove(id) {
                conn.close();
            }
        }
        if !failed.is_empty() {
            self.publish();
        }

        tracing::trace!(
            delivered = self.clients.len(),
            dropped = failed.len(),
            "Broadcast message"
        );
    }

    fn close_all(&mut self) -> usize {
        let count = self.clients.len();
        for (_, conn) in self.clients.drain() {
            conn.close();
        }
        self.publish();
        count
    }

    fn publish(&self) {
        let snapshot: Vec<Connection> = self.clients.values().cloned().collect();
        self.published.send_replace(Arc::new(snapshot));
    }
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is shut down")]
    Closed,

    #[error("Connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
