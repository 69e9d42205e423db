//! System handlers: health, engines, OpenAPI spec.

use crate::api::AppState;
use crate::engines::EngineStatus;
use axum::{Json, extract::State};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" when the server answers
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// GET /health - Health check
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "system",
    responses((status = 200, description = "Service healthy", body = HealthResponse))
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /engines - Engine availability
#[utoipa::path(
    get,
    path = "/api/v1/engines",
    tag = "system",
    responses((status = 200, description = "Engine availability", body = [EngineStatus]))
)]
pub async fn engine_status(State(state): State<AppState>) -> Json<Vec<EngineStatus>> {
    Json(state.downloader.engines().availability())
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/api/v1/openapi.json",
    tag = "system",
    responses((status = 200, description = "OpenAPI 3.1 specification"))
)]
pub async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(crate::api::ApiDoc::openapi())
}
