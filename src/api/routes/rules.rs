//! Rules CRUD handlers.
//!
//! Mutations write the rules document back to the configured file so the
//! rule set survives restarts.

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::rules::Rule;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

async fn save_rules(state: &AppState) {
    let path = &state.config.persistence.rules_file;
    if let Err(e) = state.downloader.rules().save_to_file(path).await {
        tracing::warn!(error = %e, path = %path.display(), "Failed to save rules document");
    }
}

/// GET /rules - List all rules
#[utoipa::path(
    get,
    path = "/api/v1/rules",
    tag = "rules",
    responses((status = 200, description = "Rules", body = [Rule]))
)]
pub async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.downloader.rules().list_rules().await)
}

/// POST /rules - Add a rule
#[utoipa::path(
    post,
    path = "/api/v1/rules",
    tag = "rules",
    request_body = Rule,
    responses(
        (status = 201, description = "Rule added"),
        (status = 400, description = "Invalid rule or duplicate id")
    )
)]
pub async fn add_rule(
    State(state): State<AppState>,
    Json(rule): Json<Rule>,
) -> Result<StatusCode> {
    state.downloader.rules().add_rule(rule).await?;
    save_rules(&state).await;
    Ok(StatusCode::CREATED)
}

/// PUT /rules/:id - Update a rule
#[utoipa::path(
    put,
    path = "/api/v1/rules/{id}",
    tag = "rules",
    params(("id" = String, Path, description = "Rule id")),
    request_body = Rule,
    responses(
        (status = 204, description = "Rule updated"),
        (status = 400, description = "Body id does not match path"),
        (status = 404, description = "Unknown rule")
    )
)]
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(rule): Json<Rule>,
) -> Result<StatusCode> {
    if rule.id != id {
        return Err(Error::Rule(format!(
            "rule id '{}' does not match path '{id}'",
            rule.id
        )));
    }
    if !state.downloader.rules().update_rule(rule).await {
        return Err(Error::NotFound(format!("rule {id}")));
    }
    save_rules(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /rules/:id - Delete a rule
#[utoipa::path(
    delete,
    path = "/api/v1/rules/{id}",
    tag = "rules",
    params(("id" = String, Path, description = "Rule id")),
    responses(
        (status = 204, description = "Rule deleted"),
        (status = 404, description = "Unknown rule")
    )
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if !state.downloader.rules().remove_rule(&id).await {
        return Err(Error::NotFound(format!("rule {id}")));
    }
    save_rules(&state).await;
    Ok(StatusCode::NO_CONTENT)
}
