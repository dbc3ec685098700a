//! Application State
//!
//! Shared state accessible by all route handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::websocket::Hub;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// WebSocket connection hub
    pub hub: Hub,
}

impl AppState {
    /// Create state around an existing hub
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}
