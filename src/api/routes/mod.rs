//! API route handlers, grouped by domain.

mod events;
mod queue;
mod rules;
mod system;

pub use events::{__path_event_stream, __path_events_ws, event_stream, events_ws};
pub use queue::{
    AddItemRequest, AddItemResponse, AddPlaylistResponse, PurgeResponse, SetPriorityRequest,
    __path_add_item, __path_add_playlist, __path_cancel_item, __path_get_item,
    __path_list_items, __path_pause_item, __path_purge_completed, __path_queue_status,
    __path_resume_item, __path_retry_item, __path_set_item_priority, add_item, add_playlist,
    cancel_item, get_item, list_items, pause_item, purge_completed, queue_status, resume_item,
    retry_item, set_item_priority,
};
pub use rules::{
    __path_add_rule, __path_delete_rule, __path_list_rules, __path_update_rule, add_rule,
    delete_rule, list_rules, update_rule,
};
pub use system::{
    HealthResponse, __path_engine_status, __path_health_check, __path_openapi_spec,
    engine_status, health_check, openapi_spec,
};
