//! Queue operation handlers.

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::types::{AddOutcome, DownloadOptions, ItemId, Priority, QueueItem, QueueSnapshot, Status};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

/// Request body for adding a URL to the queue
#[derive(Debug, Deserialize, ToSchema)]
pub struct AddItemRequest {
    /// URL to download
    pub url: String,

    /// Admission priority (default: normal)
    #[serde(default)]
    pub priority: Priority,

    /// Per-item download options
    #[serde(default)]
    pub options: DownloadOptions,

    /// Skip the add when the URL is already tracked (default: true)
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,
}

fn default_true() -> bool {
    true
}

/// Response for an add request
#[derive(Debug, Serialize, ToSchema)]
pub struct AddItemResponse {
    /// Created item id (absent for duplicates)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,

    /// Whether the URL was suppressed as a duplicate
    pub duplicate: bool,
}

/// Response for a playlist add request
#[derive(Debug, Serialize, ToSchema)]
pub struct AddPlaylistResponse {
    /// Created item ids (one placeholder for recognized playlists)
    pub item_ids: Vec<ItemId>,
}

/// Request body for changing an item's priority
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPriorityRequest {
    /// New priority
    pub priority: Priority,
}

/// Response for a purge request
#[derive(Debug, Serialize, ToSchema)]
pub struct PurgeResponse {
    /// Number of terminal items removed
    pub purged: usize,
}

/// Query parameters for listing items
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Status tag filter (e.g. "pending")
    pub status: Option<String>,
}

/// POST /queue - Add a URL to the queue
#[utoipa::path(
    post,
    path = "/api/v1/queue",
    tag = "queue",
    request_body = AddItemRequest,
    responses(
        (status = 201, description = "Item queued", body = AddItemResponse),
        (status = 200, description = "Duplicate skipped", body = AddItemResponse),
        (status = 503, description = "Shutting down")
    )
)]
pub async fn add_item(
    State(state): State<AppState>,
    Json(request): Json<AddItemRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .downloader
        .add(
            &request.url,
            request.priority,
            request.options,
            request.skip_duplicates,
        )
        .await?;

    Ok(match outcome {
        AddOutcome::Added(id) => (
            StatusCode::CREATED,
            Json(AddItemResponse {
                item_id: Some(id),
                duplicate: false,
            }),
        ),
        AddOutcome::DuplicateSkipped => (
            StatusCode::OK,
            Json(AddItemResponse {
                item_id: None,
                duplicate: true,
            }),
        ),
    })
}

/// POST /queue/playlist - Add a playlist URL
#[utoipa::path(
    post,
    path = "/api/v1/queue/playlist",
    tag = "queue",
    request_body = AddItemRequest,
    responses(
        (status = 201, description = "Playlist queued", body = AddPlaylistResponse),
        (status = 503, description = "Shutting down")
    )
)]
pub async fn add_playlist(
    State(state): State<AppState>,
    Json(request): Json<AddItemRequest>,
) -> Result<impl IntoResponse> {
    let item_ids = state
        .downloader
        .add_playlist(&request.url, request.priority, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(AddPlaylistResponse { item_ids })))
}

/// GET /queue - List items, optionally filtered by status
#[utoipa::path(
    get,
    path = "/api/v1/queue",
    tag = "queue",
    params(("status" = Option<String>, Query, description = "Status tag filter")),
    responses(
        (status = 200, description = "Queue items", body = [QueueItem]),
        (status = 400, description = "Unknown status tag")
    )
)]
pub async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<QueueItem>>> {
    let status = match query.status.as_deref() {
        Some(tag) => Some(
            Status::from_str(tag).map_err(|e| Error::Config {
                message: e,
                key: Some("status".to_string()),
            })?,
        ),
        None => None,
    };
    Ok(Json(state.downloader.list_items(status).await))
}

/// GET /queue/status - Queue snapshot
#[utoipa::path(
    get,
    path = "/api/v1/queue/status",
    tag = "queue",
    responses((status = 200, description = "Queue snapshot", body = QueueSnapshot))
)]
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.downloader.status().await)
}

/// GET /queue/:id - Single item
#[utoipa::path(
    get,
    path = "/api/v1/queue/{id}",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 200, description = "Queue item", body = QueueItem),
        (status = 404, description = "Unknown item")
    )
)]
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueItem>> {
    Ok(Json(state.downloader.get_item(&ItemId::new(id)).await?))
}

/// POST /queue/:id/cancel - Cancel an item
#[utoipa::path(
    post,
    path = "/api/v1/queue/{id}/cancel",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 204, description = "Cancelled"),
        (status = 404, description = "Unknown item"),
        (status = 409, description = "Item already finished")
    )
)]
pub async fn cancel_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.cancel(&ItemId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/:id/pause - Pause an item
#[utoipa::path(
    post,
    path = "/api/v1/queue/{id}/pause",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 204, description = "Paused"),
        (status = 404, description = "Unknown item"),
        (status = 409, description = "Invalid state")
    )
)]
pub async fn pause_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.pause(&ItemId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/:id/resume - Resume a paused item
#[utoipa::path(
    post,
    path = "/api/v1/queue/{id}/resume",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 204, description = "Resumed"),
        (status = 404, description = "Unknown item"),
        (status = 409, description = "Invalid state")
    )
)]
pub async fn resume_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.resume(&ItemId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/:id/retry - Re-admit a terminal item
#[utoipa::path(
    post,
    path = "/api/v1/queue/{id}/retry",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 204, description = "Re-queued"),
        (status = 404, description = "Unknown item"),
        (status = 409, description = "Item is not terminal")
    )
)]
pub async fn retry_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.retry(&ItemId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /queue/:id/priority - Set item priority
#[utoipa::path(
    patch,
    path = "/api/v1/queue/{id}/priority",
    tag = "queue",
    params(("id" = String, Path, description = "Item id")),
    request_body = SetPriorityRequest,
    responses(
        (status = 204, description = "Priority updated"),
        (status = 404, description = "Unknown item")
    )
)]
pub async fn set_item_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetPriorityRequest>,
) -> Result<StatusCode> {
    state
        .downloader
        .set_priority(&ItemId::new(id), request.priority)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /queue/completed - Purge terminal items
#[utoipa::path(
    delete,
    path = "/api/v1/queue/completed",
    tag = "queue",
    responses((status = 200, description = "Purged", body = PurgeResponse))
)]
pub async fn purge_completed(State(state): State<AppState>) -> Result<Json<PurgeResponse>> {
    let purged = state.downloader.purge_completed().await?;
    Ok(Json(PurgeResponse { purged }))
}
