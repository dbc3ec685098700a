//! Message Dispatch
//!
//! Routes each inbound message to the handler registered for its type.
//! Messages with no handler are relayed to every connection, sender
//! included.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use super::connection::Connection;
use super::hub::{Hub, HubError};
use super::messages::Message;

/// Result returned by message handlers
pub type HandlerResult = anyhow::Result<()>;

/// Application logic for one message type
///
/// Handlers may call [`Hub::send`] or [`Hub::broadcast`]. An error is
/// logged by the dispatcher; the connection stays open.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, conn: &Connection, message: Message) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
///
/// ```rust,ignore
/// hub.register_handler("shout", handler_fn(|hub, _conn, msg| async move {
///     hub.broadcast(&msg).await?;
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Hub, Connection, Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Hub, Connection, Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, hub: &Hub, conn: &Connection, message: Message) -> HandlerResult {
        (self.0)(hub.clone(), conn.clone(), message).await
    }
}

/// Sends the message back to the connection it came from
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, hub: &Hub, conn: &Connection, message: Message) -> HandlerResult {
        hub.send(conn, &message).await?;
        Ok(())
    }
}

/// Relays the message to every connection
pub struct BroadcastHandler;

#[async_trait]
impl MessageHandler for BroadcastHandler {
    async fn handle(&self, hub: &Hub, _conn: &Connection, message: Message) -> HandlerResult {
        hub.broadcast(&message).await?;
        Ok(())
    }
}

/// Handlers that can be named in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinHandler {
    Echo,
    Broadcast,
}

impl BuiltinHandler {
    pub fn handler(self) -> Arc<dyn MessageHandler> {
        match self {
            BuiltinHandler::Echo => Arc::new(EchoHandler),
            BuiltinHandler::Broadcast => Arc::new(BroadcastHandler),
        }
    }
}

/// Message type → handler
///
/// Read on every inbound message, written rarely. Lookups clone the
/// handler out so the lock is never held while a handler runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the last registration for a type wins
    pub fn register(&self, kind: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.register_arc(kind, Arc::new(handler));
    }

    pub fn register_arc(&self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let kind = kind.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), handler)
            .is_some();

        tracing::debug!(message_type = %kind, replaced, "Registered message handler");
    }

    /// Remove the handler for a type, returning whether one existed
    pub fn remove(&self, kind: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
            .is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Registered message types, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

/// What the dispatcher did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran and succeeded
    Handled,
    /// A handler ran and returned an error (already logged)
    HandlerFailed,
    /// No handler; the message was broadcast
    Relayed,
}

/// Route one inbound message
///
/// Only a failed fallback broadcast is reported as an error, which means
/// the hub has shut down.
pub async fn dispatch(hub: &Hub, conn: &Connection, message: Message) -> Result<Dispatch, HubError> {
    let Some(handler) = hub.handlers().get(message.kind()) else {
        hub.broadcast(&message).await?;
        return Ok(Dispatch::Relayed);
    };

    let kind = message.kind().to_string();
    match handler.handle(hub, conn, message).await {
        Ok(()) => Ok(Dispatch::Handled),
        Err(e) => {
            tracing::warn!(
                connection_id = %conn.id(),
                message_type = %kind,
                error = %format!("{:#}", e),
                "Message handler failed"
            );
            Ok(Dispatch::HandlerFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use crate::websocket::hub::HubConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Stand-in for the socket writer: acks every frame and forwards it
    fn ack_writer(mut rx: mpsc::Receiver<Outbound>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, out) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let _ = tx.send(Message::decode(outbound.frame.as_bytes()).unwrap());
                if let Some(ack) = outbound.ack {
                    let _ = ack.send(Ok(()));
                }
            }
        });
        out
    }

    async fn connect(hub: &Hub) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (conn, rx) = Connection::new(None, 16, Duration::from_secs(1));
        hub.register(conn.clone()).await.unwrap();
        (conn, ack_writer(rx))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("writer closed")
    }

    async fn settle(hub: &Hub) {
        hub.unregister("settle-barrier").await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_goes_to_sender_only() {
        let hub = Hub::spawn(HubConfig::default());
        hub.register_handler("echo", EchoHandler);

        let (sender, mut sender_rx) = connect(&hub).await;
        let (_other, mut other_rx) = connect(&hub).await;

        let msg = Message::from_raw("echo", r#"{"data":"x"}"#).unwrap();
        let outcome = dispatch(&hub, &sender, msg.clone()).await.unwrap();

        assert_eq!(outcome, Dispatch::Handled);
        assert_eq!(next(&mut sender_rx).await, msg);
        settle(&hub).await;
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhandled_type_is_relayed_to_everyone() {
        let hub = Hub::spawn(HubConfig::default());
        let (sender, mut sender_rx) = connect(&hub).await;
        let (_other, mut other_rx) = connect(&hub).await;

        let msg = Message::from_raw("chat", r#"{"text":"hi"}"#).unwrap();
        let outcome = dispatch(&hub, &sender, msg.clone()).await.unwrap();

        assert_eq!(outcome, Dispatch::Relayed);
        assert_eq!(next(&mut sender_rx).await, msg);
        assert_eq!(next(&mut other_rx).await, msg);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let hub = Hub::spawn(HubConfig::default());
        hub.register_handler(
            "error",
            handler_fn(|_hub, _conn, _msg| async move {
                Err::<(), _>(anyhow::anyhow!("simulated error for testing purposes"))
            }),
        );

        let (conn, _rx) = connect(&hub).await;
        let msg = Message::from_raw("error", r#"{"data":"error test"}"#).unwrap();

        let outcome = dispatch(&hub, &conn, msg).await.unwrap();
        assert_eq!(outcome, Dispatch::HandlerFailed);
        assert!(conn.is_open());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_handler() {
        let hub = Hub::spawn(HubConfig::default());
        hub.register_handler("broadcast", BroadcastHandler);

        let (sender, mut sender_rx) = connect(&hub).await;
        let (_other, mut other_rx) = connect(&hub).await;

        let msg = Message::from_raw("broadcast", r#"{"n":1}"#).unwrap();
        assert_eq!(
            dispatch(&hub, &sender, msg.clone()).await.unwrap(),
            Dispatch::Handled
        );
        assert_eq!(next(&mut sender_rx).await, msg);
        assert_eq!(next(&mut other_rx).await, msg);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let hub = Hub::spawn(HubConfig::default());
        hub.register_handler("greet", EchoHandler);
        hub.register_handler(
            "greet",
            handler_fn(|hub, conn, _msg| async move {
                let reply = Message::from_raw("greeting", r#""hello""#)?;
                hub.send(&conn, &reply).await?;
                Ok::<_, anyhow::Error>(())
            }),
        );
        assert_eq!(hub.handlers().kinds(), vec!["greet".to_string()]);

        let (conn, mut rx) = connect(&hub).await;
        dispatch(&hub, &conn, Message::from_raw("greet", "null").unwrap())
            .await
            .unwrap();

        let reply = next(&mut rx).await;
        assert_eq!(reply.kind(), "greeting");
        assert_eq!(reply.payload(), r#""hello""#);
    }

    #[tokio::test]
    async fn test_relay_after_shutdown_fails() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, _rx) = connect(&hub).await;
        hub.shutdown().await.unwrap();

        let msg = Message::from_raw("chat", "{}").unwrap();
        assert!(matches!(
            dispatch(&hub, &conn, msg).await,
            Err(HubError::Closed)
        ));
    }

    #[test]
    fn test_registry_remove() {
        let registry = HandlerRegistry::new();
        registry.register("echo", EchoHandler);

        assert!(registry.contains("echo"));
        assert!(registry.remove("echo"));
        assert!(!registry.remove("echo"));
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn test_builtin_handler_names() {
        let parsed: HashMap<String, BuiltinHandler> =
            toml::from_str("echo = \"echo\"\nshout = \"broadcast\"").unwrap();

        assert_eq!(parsed["echo"], BuiltinHandler::Echo);
        assert_eq!(parsed["shout"], BuiltinHandler::Broadcast);
    }
}
