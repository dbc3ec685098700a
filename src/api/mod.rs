//! Switchboard HTTP Surface
//!
//! HTTP layer built with Axum. It only exists to host the WebSocket
//! endpoint and the health probes.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws` - Upgrade to a hub connection
//!
//! ## Health
//! - `GET /health` - `{"status": "healthy"}`
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//!
//! # Example
//!
//! ```rust,ignore
//! use switchboard::api::{build_router, AppState};
//! use switchboard::websocket::{Hub, HubConfig};
//!
//! let hub = Hub::spawn(HubConfig::default());
//! let router = build_router(AppState::new(hub));
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::websocket::websocket_handler;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/", get(routes::health::health))
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .route("/ws", get(websocket_handler))
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{Hub, HubConfig};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use tower::util::ServiceExt;

    fn create_test_app() -> (Router, Hub) {
        let hub = Hub::spawn(HubConfig::default());
        let router = build_router(AppState::new(hub.clone()));
        (router, hub)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _hub) = create_test_app();

        let response = app.oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"status":"healthy"}"#);
    }

    #[tokio::test]
    async fn test_health_live() {
        let (app, _hub) = create_test_app();

        let response = app.oneshot(get_request("/health/live")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready_follows_hub() {
        let (app, hub) = create_test_app();

        let response = app
            .clone()
            .oneshot(get_request("/health/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        hub.shutdown().await.unwrap();

        let response = app.oneshot(get_request("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (app, _hub) = create_test_app();

        let response = app.oneshot(get_request("/ws")).await.unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (app, _hub) = create_test_app();

        let response = app.oneshot(get_request("/nope")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
