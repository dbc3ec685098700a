//! Server Lifecycle
//!
//! [`HubServer`] binds the listener, brings the hub coordinator online,
//! serves `/ws` and the health routes in the background, and tears it all
//! down again.
//!
//! Lifecycle rules:
//! - `start` while running fails with [`ServerError::AlreadyRunning`];
//!   after `stop` it fails with [`ServerError::Stopped`]
//! - `stop` before `start` fails with [`ServerError::NotStarted`]
//! - a second `stop` is a no-op

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::api::{build_router, AppState};
use crate::config::{Config, ServerConfig};
use crate::websocket::{
    Connection, ConnectionError, Hub, HubError, Message, MessageHandler,
};

/// The hub plus its listening surface
pub struct HubServer {
    config: ServerConfig,
    hub: Hub,
    lifecycle: Mutex<Lifecycle>,
    bound: OnceLock<SocketAddr>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    started_at: Instant,
}

impl HubServer {
    /// Create a server from configuration, installing the configured
    /// built-in handlers
    pub fn new(config: &Config) -> Self {
        let hub = Hub::new(config.hub_config());
        for (kind, builtin) in &config.handlers {
            hub.handlers().register_arc(kind.clone(), builtin.handler());
        }

        Self::with_hub(config.server.clone(), hub)
    }

    /// Create a server around an existing hub
    pub fn with_hub(config: ServerConfig, hub: Hub) -> Self {
        Self {
            config,
            hub,
            lifecycle: Mutex::new(Lifecycle::Idle),
            bound: OnceLock::new(),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Register a handler for a message type; allowed before or after start
    pub fn register_handler(&self, kind: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.hub.register_handler(kind, handler);
    }

    /// Remove the handler for a message type; its messages are relayed again
    pub fn remove_handler(&self, kind: &str) -> bool {
        self.hub.remove_handler(kind)
    }

    /// Snapshot of the registered connections
    pub fn clients(&self) -> Vec<Connection> {
        self.hub.clients()
    }

    pub async fn broadcast(&self, message: &Message) -> Result<(), HubError> {
        self.hub.broadcast(message).await
    }

    pub async fn send(&self, conn: &Connection, message: &Message) -> Result<(), ConnectionError> {
        self.hub.send(conn, message).await
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    /// Port the listener is bound to, once started
    ///
    /// With `port = 0` in the config this is the port the OS picked.
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bind the listener and start serving in the background
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(ServerError::AlreadyRunning),
            Lifecycle::Stopped => return Err(ServerError::Stopped),
        }

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        self.hub.start();

        let router = build_router(AppState::new(self.hub.clone()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        tracing::info!("Switchboard listening on {}", local_addr);
        tracing::info!("WebSocket endpoint: ws://{}/ws", local_addr);

        let _ = self.bound.set(local_addr);
        *lifecycle = Lifecycle::Running(Running {
            shutdown: shutdown_tx,
            task,
            started_at: Instant::now(),
        });

        Ok(local_addr)
    }

    /// Stop accepting connections, close every registered connection and
    /// wait for the listener task, bounded by the shutdown timeout
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                return Err(ServerError::NotStarted);
            }
        };

        tracing::info!("Shutting down, no longer accepting connections");
        let _ = running.shutdown.send(());

        let closed = match self.hub.shutdown().await {
            Ok(closed) => closed,
            // Someone shut the hub down directly
            Err(HubError::Closed) => 0,
            Err(e) => return Err(e.into()),
        };

        let mut task = running.task;
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Listener exited with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Listener task failed"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "Shutdown timed out, aborting remaining connections"
                );
                task.abort();
            }
        }

        tracing::info!(
            connections_closed = closed,
            uptime_secs = running.started_at.elapsed().as_secs(),
            "Switchboard stopped"
        );
        Ok(())
    }

    /// Start, serve until Ctrl+C or SIGTERM, then stop
    pub async fn run_until_signal(&self) -> Result<(), ServerError> {
        self.start().await?;
        shutdown_signal().await;
        self.stop().await
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

/// Server lifecycle errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server has not been started")]
    NotStarted,

    #[error("Server has been stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}
