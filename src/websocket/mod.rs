//! WebSocket Connection Hub
//!
//! Accepts WebSocket connections, keeps track of the live ones and relays
//! JSON messages between them.
//!
//! ## Architecture
//!
//! - **Hub**: single coordinator task owning the connection registry;
//!   register, unregister and broadcast are serialized through it
//! - **Connection**: cloneable handle to one socket (id, outbound queue,
//!   `Open → Closing → Closed` state)
//! - **Dispatch**: per-type handler lookup, falling back to broadcast
//! - **Handler**: WebSocket upgrade plus the per-connection read and write
//!   loops
//! - **Messages**: the `{"type": ..., "payload": ...}` wire format
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8080/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'chat', payload: {text: 'hello'}}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log('Received:', msg.type, msg.payload);
//! };
//! ```

mod connection;
mod dispatch;
mod handler;
mod hub;
mod messages;

pub use connection::{Connection, ConnectionError, ConnectionId, ConnectionState, Outbound};
pub use dispatch::{
    dispatch, handler_fn, BroadcastHandler, BuiltinHandler, Dispatch, EchoHandler, FnHandler,
    HandlerRegistry, HandlerResult, MessageHandler,
};
pub use handler::{handle_socket, websocket_handler};
pub use hub::{Hub, HubConfig, HubError};
pub use messages::Message;
