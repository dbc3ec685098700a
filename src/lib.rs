//! # Switchboard
//!
//! A WebSocket message hub. Clients connect on `/ws`, send JSON messages of
//! the form `{"type": ..., "payload": ...}`, and the hub routes each one to
//! the handler registered for its type or relays it to every connection.
//!
//! ## Modules
//!
//! - [`websocket`]: Hub coordinator, connections, message dispatch
//! - [`server`]: Start/stop lifecycle around the listener
//! - [`api`]: Axum router with the `/ws` and health routes
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchboard::{Config, EchoHandler, HubServer, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = HubServer::new(&Config::default());
//!     server.register_handler("echo", EchoHandler);
//!
//!     let addr = server.start().await?;
//!     println!("Listening on {}", addr);
//!
//!     // Push a notice to everyone connected
//!     let notice = Message::new("notice", &serde_json::json!({"text": "hello"}))?;
//!     server.broadcast(&notice).await?;
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod server;
pub mod websocket;

pub use config::{Config, ConfigError};
pub use server::{HubServer, ServerError};
pub use websocket::{
    handler_fn, BroadcastHandler, Connection, ConnectionError, EchoHandler, Hub, HubConfig,
    HubError, Message, MessageHandler,
};
