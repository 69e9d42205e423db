//! REST API server module
//!
//! Provides an OpenAPI 3.1 compliant REST surface over the scheduler's
//! public operations, plus an SSE stream and a WebSocket endpoint bridged
//! to the event bus.

use crate::{Config, MediaDownloader, error::Result};
use axum::{
    Router,
    http::HeaderValue,
    routing::{delete, get, patch, post, put},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Queue
/// - `POST /queue` - Add a URL
/// - `POST /queue/playlist` - Add a playlist URL
/// - `GET /queue` - List items (optional `?status=` filter)
/// - `GET /queue/status` - Queue snapshot
/// - `GET /queue/:id` - Get a single item
/// - `POST /queue/:id/cancel` - Cancel item
/// - `POST /queue/:id/pause` - Pause item
/// - `POST /queue/:id/resume` - Resume item
/// - `POST /queue/:id/retry` - Re-admit a terminal item
/// - `PATCH /queue/:id/priority` - Set priority
/// - `DELETE /queue/completed` - Purge terminal items
///
/// ## Rules
/// - `GET /rules` - List rules
/// - `POST /rules` - Add rule
/// - `PUT /rules/:id` - Update rule
/// - `DELETE /rules/:id` - Delete rule
///
/// ## System
/// - `GET /engines` - Engine availability
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /events` - Server-sent events stream
/// - `GET /events/ws` - WebSocket event stream
pub fn create_router(downloader: MediaDownloader, config: Arc<Config>) -> Router {
    let state = AppState::new(downloader, config.clone());

    let router = Router::new()
        // Queue
        .route("/queue", post(routes::add_item))
        .route("/queue", get(routes::list_items))
        .route("/queue/playlist", post(routes::add_playlist))
        .route("/queue/status", get(routes::queue_status))
        .route("/queue/completed", delete(routes::purge_completed))
        .route("/queue/:id", get(routes::get_item))
        .route("/queue/:id/cancel", post(routes::cancel_item))
        .route("/queue/:id/pause", post(routes::pause_item))
        .route("/queue/:id/resume", post(routes::resume_item))
        .route("/queue/:id/retry", post(routes::retry_item))
        .route("/queue/:id/priority", patch(routes::set_item_priority))
        // Rules
        .route("/rules", get(routes::list_rules))
        .route("/rules", post(routes::add_rule))
        .route("/rules/:id", put(routes::update_rule))
        .route("/rules/:id", delete(routes::delete_rule))
        // System
        .route("/engines", get(routes::engine_status))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        // Events
        .route("/events", get(routes::event_stream))
        .route("/events/ws", get(routes::events_ws));

    let router = Router::new().nest("/api/v1", router).with_state(state);

    if config.api.cors_enabled {
        router.layer(build_cors_layer(&config.api.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// "*" (or an empty list) allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address
///
/// Binds a TCP listener and serves until shutdown or an error.
pub async fn start_api_server(downloader: MediaDownloader, config: Arc<Config>) -> Result<()> {
    let bind_address = config.api.bind_address;

    tracing::info!(address = %bind_address, "Starting API server");

    let app = create_router(downloader, config);
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(address = %bind_address, "API server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}
