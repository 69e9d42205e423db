//! OpenAPI documentation and schema generation
//!
//! Compile-time OpenAPI 3.1 specification for the media-dl REST API,
//! served at `/api/v1/openapi.json`.

use utoipa::OpenApi;

/// OpenAPI documentation for the media-dl REST API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "media-dl REST API",
        version = "0.1.0",
        description = "REST API for the multi-engine media download orchestrator: queue management, rules, engine status, and event streams",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:6791", description = "Local development server")
    ),
    paths(
        // Queue
        crate::api::routes::add_item,
        crate::api::routes::add_playlist,
        crate::api::routes::list_items,
        crate::api::routes::queue_status,
        crate::api::routes::get_item,
        crate::api::routes::cancel_item,
        crate::api::routes::pause_item,
        crate::api::routes::resume_item,
        crate::api::routes::retry_item,
        crate::api::routes::set_item_priority,
        crate::api::routes::purge_completed,

        // Rules
        crate::api::routes::list_rules,
        crate::api::routes::add_rule,
        crate::api::routes::update_rule,
        crate::api::routes::delete_rule,

        // System
        crate::api::routes::health_check,
        crate::api::routes::engine_status,
        crate::api::routes::openapi_spec,

        // Events
        crate::api::routes::event_stream,
        crate::api::routes::events_ws,
    ),
    components(schemas(
        crate::api::routes::AddItemRequest,
        crate::api::routes::AddItemResponse,
        crate::api::routes::AddPlaylistResponse,
        crate::api::routes::SetPriorityRequest,
        crate::api::routes::PurgeResponse,
        crate::api::routes::HealthResponse,
        crate::error::ApiError,
        crate::error::ErrorDetail,
        crate::engines::EngineStatus,
        crate::rules::Rule,
        crate::rules::RuleCondition,
        crate::rules::RuleAction,
        crate::rules::Combinator,
        crate::rules::ConditionField,
        crate::rules::Operator,
        crate::rules::NotifySeverity,
        crate::types::DownloadOptions,
        crate::types::EngineKind,
        crate::types::ItemId,
        crate::types::Priority,
        crate::types::Progress,
        crate::types::QueueCounters,
        crate::types::QueueItem,
        crate::types::QueueSnapshot,
        crate::types::BandwidthSnapshot,
        crate::types::Status,
    )),
    tags(
        (name = "queue", description = "Queue management"),
        (name = "rules", description = "Rules engine"),
        (name = "system", description = "System status"),
        (name = "events", description = "Event streams")
    )
)]
pub struct ApiDoc;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_generates_and_contains_queue_paths() {
        let spec = ApiDoc::openapi();
        let json = serde_json::to_value(&spec).unwrap();
        let paths = json["paths"].as_object().unwrap();
        assert!(paths.contains_key("/api/v1/queue"));
        assert!(paths.contains_key("/api/v1/queue/{id}/cancel"));
        assert!(paths.contains_key("/api/v1/rules"));
        assert!(paths.contains_key("/api/v1/events"));
    }
}
