//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and manages the connection lifecycle.
//!
//! Each accepted socket is split in two. A writer task owns the sink and
//! drains the connection's outbound queue; the read loop runs on the
//! upgrade task and feeds every inbound message to the dispatcher. Whichever
//! side stops first closes the connection, which wakes the other.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionError, Outbound};
use super::dispatch::dispatch;
use super::hub::Hub;
use super::messages::Message;
use crate::api::{ApiError, AppState};

/// WebSocket upgrade handler
///
/// This is the entry point for WebSocket connections on `/ws`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    if !state.hub.is_running() {
        return Err(ApiError::ServiceUnavailable(
            "hub is not accepting connections".to_string(),
        ));
    }

    let hub = state.hub.clone();
    let remote = connect_info.map(|ConnectInfo(addr)| addr);

    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::warn!(remote = ?remote, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, hub, remote)))
}

/// Handle an established WebSocket connection
pub async fn handle_socket(socket: WebSocket, hub: Hub, remote: Option<SocketAddr>) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, hub, remote).await;
}

/// Register one connection, pump its frames both ways, then unregister it
async fn serve_connection<Si, St>(sink: Si, stream: St, hub: Hub, remote: Option<SocketAddr>)
where
    Si: Sink<WsMessage> + Send + Unpin + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let write_timeout = hub.config().write_timeout;
    let (conn, outbound) = Connection::new(remote, hub.config().outbound_capacity, write_timeout);

    // The writer exists before registration so broadcasts queued right
    // after `register` returns have somewhere to go.
    let mut writer = tokio::spawn(write_loop(sink, outbound, conn.clone(), write_timeout));

    if let Err(e) = hub.register(conn.clone()).await {
        tracing::warn!(remote = ?remote, error = %e, "Rejected WebSocket connection");
        conn.close();
        finish_writer(&mut writer, write_timeout).await;
        return;
    }

    read_loop(stream, &hub, &conn).await;

    // Cleanup: unregister from hub
    if let Err(e) = hub.unregister(conn.id()).await {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Unregister after hub shutdown");
    }
    conn.close();
    finish_writer(&mut writer, write_timeout).await;
}

/// Read frames until the peer goes away, a frame is malformed, or the
/// connection is closed from the hub side
async fn read_loop<St>(mut stream: St, hub: &Hub, conn: &Connection)
where
    St: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = conn.closed() => {
                tracing::debug!(connection_id = %conn.id(), "Connection closed by hub");
                return;
            }
            frame = stream.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                // Axum answers pings itself
                continue;
            }
            Some(Ok(WsMessage::Close(_))) => {
                tracing::debug!(connection_id = %conn.id(), "Client requested close");
                return;
            }
            Some(Err(e)) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    error = %e,
                    "WebSocket receive error"
                );
                return;
            }
            None => return,
        };

        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    error = %e,
                    "Invalid client message, closing connection"
                );
                return;
            }
        };

        if let Err(e) = dispatch(hub, conn, message).await {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Dispatch stopped");
            return;
        }
    }
}

/// Drain the outbound queue into the socket
///
/// Every write is bounded by `write_timeout`; a failed or slow write closes
/// the connection.
async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    conn: Connection,
    write_timeout: Duration,
) where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed() => break,
            next = outbound.recv() => next,
        };

        let Some(Outbound { frame, ack }) = next else {
            break;
        };

        let result = match tokio::time::timeout(
            write_timeout,
            sink.send(WsMessage::Text(frame.to_string())),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
            Err(_) => Err(ConnectionError::Timeout),
        };

        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket send failed, closing connection");
        }
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if failed {
            conn.close();
            break;
        }
    }

    // Best effort; the peer may already be gone
    let _ = tokio::time::timeout(write_timeout, async {
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;

    conn.mark_closed();
}

async fn finish_writer(writer: &mut tokio::task::JoinHandle<()>, write_timeout: Duration) {
    // The writer bounds its own close frame by `write_timeout`
    if tokio::time::timeout(write_timeout * 2, &mut *writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{ConnectionState, HubConfig};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink standing in for a peer that stopped reading or whose socket broke
    enum TestSink {
        Stalled,
        Broken,
    }

    impl TestSink {
        fn poll(&self) -> Poll<Result<(), axum::Error>> {
            match self {
                TestSink::Stalled => Poll::Pending,
                TestSink::Broken => Poll::Ready(Err(axum::Error::new("connection reset"))),
            }
        }
    }

    impl Sink<WsMessage> for TestSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.poll()
        }

        fn start_send(self: Pin<&mut Self>, _item: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.poll()
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.poll()
        }
    }

    fn test_hub() -> Hub {
        Hub::spawn(HubConfig {
            write_timeout: Duration::from_millis(50),
            ..Default::default()
        })
    }

    /// Run a connection whose reader never receives anything
    async fn open_connection(hub: &Hub, sink: TestSink) -> (Connection, tokio::task::JoinHandle<()>) {
        let task = tokio::spawn(serve_connection(
            sink,
            futures_util::stream::pending(),
            hub.clone(),
            None,
        ));

        let conn = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(conn) = hub.clients().pop() {
                    return conn;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection never registered");

        (conn, task)
    }

    async fn wait_until_gone(hub: &Hub, task: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection task did not finish")
            .unwrap();
        assert!(hub.clients().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_write_drops_connection() {
        let hub = test_hub();
        let (conn, task) = open_connection(&hub, TestSink::Stalled).await;

        let msg = Message::from_raw("test", r#"{"data":"stuck"}"#).unwrap();
        hub.broadcast(&msg).await.unwrap();

        wait_until_gone(&hub, task).await;
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_failed_write_drops_connection() {
        let hub = test_hub();
        let (conn, task) = open_connection(&hub, TestSink::Broken).await;

        let msg = Message::from_raw("test", "{}").unwrap();
        let result = hub.send(&conn, &msg).await;
        assert!(matches!(result, Err(ConnectionError::Transport(_))));

        wait_until_gone(&hub, task).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let hub = test_hub();
        let task = tokio::spawn(serve_connection(
            futures_util::sink::drain(),
            futures_util::stream::iter(vec![Ok(WsMessage::Close(None))]),
            hub.clone(),
            None,
        ));

        wait_until_gone(&hub, task).await;
    }
}
