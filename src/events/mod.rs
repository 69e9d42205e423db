//! Event bus for inter-component communication
//!
//! Typed in-process publish/subscribe with bounded history, pre-dispatch
//! filters, and a WebSocket fan-out list. Registered subscribers are invoked
//! by a single dispatcher task, so every subscriber observes events in
//! publish order; subscriber errors are trapped and logged, never raised
//! back into the bus. External consumers (SSE bridges, tests) use the
//! broadcast-channel [`subscribe`](EventBus::subscribe) instead.
//!
//! History is in-memory only; nothing survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{broadcast, mpsc};
use utoipa::ToSchema;
use uuid::Uuid;

/// Closed set of event types
///
/// The serialized names are stable identifiers used on the wire and in
/// persisted records; they are not language symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum EventType {
    /// Item accepted into the queue (alias of `queue.item_added` for upper layers)
    #[serde(rename = "download.queued")]
    DownloadQueued,
    /// Item admitted; fetch started
    #[serde(rename = "download.started")]
    DownloadStarted,
    /// Normalized progress update from the active engine
    #[serde(rename = "download.progress")]
    DownloadProgress,
    /// Item completed successfully
    #[serde(rename = "download.completed")]
    DownloadCompleted,
    /// Item reached Failed
    #[serde(rename = "download.failed")]
    DownloadFailed,
    /// Item cancelled by user
    #[serde(rename = "download.cancelled")]
    DownloadCancelled,
    /// Item paused by user
    #[serde(rename = "download.paused")]
    DownloadPaused,
    /// Item resumed by user
    #[serde(rename = "download.resumed")]
    DownloadResumed,

    /// Queue admin: item record created
    #[serde(rename = "queue.item_added")]
    QueueItemAdded,
    /// Queue admin: item record removed
    #[serde(rename = "queue.item_removed")]
    QueueItemRemoved,
    /// Queue admin: aggregate status changed
    #[serde(rename = "queue.status_changed")]
    QueueStatusChanged,
    /// Queue admin: terminal items purged
    #[serde(rename = "queue.cleared")]
    QueueCleared,

    /// Playlist expansion began
    #[serde(rename = "playlist.started")]
    PlaylistStarted,
    /// A playlist child reached a terminal state
    #[serde(rename = "playlist.item_completed")]
    PlaylistItemCompleted,
    /// All playlist children completed
    #[serde(rename = "playlist.completed")]
    PlaylistCompleted,
    /// Playlist settled with failures
    #[serde(rename = "playlist.failed")]
    PlaylistFailed,

    /// Router chose an engine for an item
    #[serde(rename = "engine.selected")]
    EngineSelected,
    /// Router switched engines mid-item
    #[serde(rename = "engine.switched")]
    EngineSwitched,
    /// Engine-level error
    #[serde(rename = "engine.error")]
    EngineError,

    /// Downloader constructed and ready
    #[serde(rename = "system.startup")]
    SystemStartup,
    /// Graceful shutdown initiated
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
    /// Internal error surfaced to observers
    #[serde(rename = "system.error")]
    SystemError,
    /// Runtime settings changed
    #[serde(rename = "settings.changed")]
    SettingsChanged,
}

impl EventType {
    /// Stable string name of this event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DownloadQueued => "download.queued",
            EventType::DownloadStarted => "download.started",
            EventType::DownloadProgress => "download.progress",
            EventType::DownloadCompleted => "download.completed",
            EventType::DownloadFailed => "download.failed",
            EventType::DownloadCancelled => "download.cancelled",
            EventType::DownloadPaused => "download.paused",
            EventType::DownloadResumed => "download.resumed",
            EventType::QueueItemAdded => "queue.item_added",
            EventType::QueueItemRemoved => "queue.item_removed",
            EventType::QueueStatusChanged => "queue.status_changed",
            EventType::QueueCleared => "queue.cleared",
            EventType::PlaylistStarted => "playlist.started",
            EventType::PlaylistItemCompleted => "playlist.item_completed",
            EventType::PlaylistCompleted => "playlist.completed",
            EventType::PlaylistFailed => "playlist.failed",
            EventType::EngineSelected => "engine.selected",
            EventType::EngineSwitched => "engine.switched",
            EventType::EngineError => "engine.error",
            EventType::SystemStartup => "system.startup",
            EventType::SystemShutdown => "system.shutdown",
            EventType::SystemError => "system.error",
            EventType::SettingsChanged => "settings.changed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event published on the bus
///
/// Immutable once published; timestamps are monotonic per emitter.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Event {
    /// Unique event id
    pub id: Uuid,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Source component name
    pub source: String,

    /// Publish timestamp
    pub timestamp: DateTime<Utc>,

    /// Event payload
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Map<String, Value>,

    /// Additional metadata (ambient facts stamped by the publisher)
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Event {
    /// Build a new event with a fresh id and the current timestamp
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        data: serde_json::Map<String, Value>,
        metadata: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        }
    }

    /// Convenience accessor for a string field in the payload
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Build an event payload map from a `serde_json::json!` object literal
///
/// Non-object values produce an empty map.
pub fn payload(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// A registered event subscriber
///
/// Implementations must not call back into the scheduler synchronously from
/// `on_event`; post commands on a channel instead.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscriber name, used in error logs
    fn name(&self) -> &str;

    /// Handle one event. Errors are trapped and logged by the dispatcher.
    async fn on_event(&self, event: &Event) -> crate::error::Result<()>;
}

/// What a registered subscriber listens to
#[derive(Clone, Debug)]
pub enum Subscription {
    /// Only the listed event types
    Types(Vec<EventType>),
    /// Every event (wildcard)
    All,
}

impl Subscription {
    fn matches(&self, event_type: EventType) -> bool {
        match self {
            Subscription::Types(types) => types.contains(&event_type),
            Subscription::All => true,
        }
    }
}

/// Identifier for a registered subscriber, used to unsubscribe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Identifier for a registered WebSocket fan-out connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WsConnId(u64);

/// Event filter predicate applied before history and dispatch
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Handler {
    id: HandlerId,
    selector: Subscription,
    subscriber: Arc<dyn EventSubscriber>,
}

struct WsConn {
    id: WsConnId,
    tx: mpsc::UnboundedSender<String>,
}

/// Event bus statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct EventBusStats {
    /// Events accepted by publish (after filters)
    pub events_published: u64,
    /// Subscriber invocations that completed
    pub events_handled: u64,
    /// Subscriber invocations that returned an error
    pub handler_errors: u64,
    /// Registered non-wildcard subscribers
    pub active_handlers: usize,
    /// Registered wildcard subscribers
    pub wildcard_handlers: usize,
    /// Live WebSocket fan-out connections
    pub websocket_connections: usize,
    /// Events currently retained in history
    pub history_size: usize,
    /// Registered filters
    pub active_filters: usize,
}

struct BusInner {
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    filters: RwLock<Vec<EventFilter>>,
    handlers: RwLock<Vec<Handler>>,
    websockets: Mutex<Vec<WsConn>>,
    next_handler_id: AtomicU64,
    next_ws_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<Event>,
    broadcast_tx: broadcast::Sender<Event>,
    events_published: AtomicU64,
    events_handled: AtomicU64,
    handler_errors: AtomicU64,
}

/// Central event bus (cloneable handle)
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Broadcast buffer for external subscribers; laggards receive `Lagged`.
const BROADCAST_CAPACITY: usize = 1000;

impl EventBus {
    /// Create a new event bus and spawn its dispatcher task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(history_capacity: usize) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let inner = Arc::new(BusInner {
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            filters: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            websockets: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(0),
            next_ws_id: AtomicU64::new(0),
            dispatch_tx,
            broadcast_tx,
            events_published: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        });

        // The dispatcher holds only a weak reference so the bus (and the
        // channel sender inside it) can drop, which ends the task.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(dispatch_loop(weak, dispatch_rx));

        Self { inner }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns after the event has been recorded and scheduled for dispatch;
    /// subscriber invocations complete asynchronously, in publish order.
    /// A failing filter drops the event for all subscribers.
    pub fn publish(
        &self,
        event_type: EventType,
        source: &str,
        data: serde_json::Map<String, Value>,
        metadata: serde_json::Map<String, Value>,
    ) -> Event {
        let event = Event::new(event_type, source, data, metadata);

        {
            let filters = self
                .inner
                .filters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if filters.iter().any(|filter| !filter(&event)) {
                tracing::debug!(event_id = %event.id, event_type = %event_type, "Event filtered out");
                return event;
            }
        }

        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            history.push_back(event.clone());
            while history.len() > self.inner.history_capacity {
                history.pop_front();
            }
        }

        self.inner.events_published.fetch_add(1, Ordering::Relaxed);

        // send() fails only with no receivers, which is fine
        self.inner.broadcast_tx.send(event.clone()).ok();
        self.inner.dispatch_tx.send(event.clone()).ok();

        tracing::debug!(event_type = %event_type, source = source, "Published event");
        event
    }

    /// Subscribe to all events via a broadcast receiver
    ///
    /// Each receiver observes events independently in publish order. A
    /// receiver more than [`BROADCAST_CAPACITY`] events behind gets
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Register a subscriber for specific event types (or all)
    pub fn subscribe_handler(
        &self,
        selector: Subscription,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(handler = subscriber.name(), "Subscribed handler");
        handlers.push(Handler {
            id,
            selector,
            subscriber,
        });
        id
    }

    /// Remove a registered subscriber
    ///
    /// Returns true if the handler was found and removed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() < before
    }

    /// Add a filter predicate; events failing any filter are dropped entirely
    pub fn add_filter(&self, filter: EventFilter) {
        let mut filters = self
            .inner
            .filters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        filters.push(filter);
    }

    /// Remove all filters
    pub fn clear_filters(&self) {
        let mut filters = self
            .inner
            .filters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        filters.clear();
    }

    /// Register a WebSocket fan-out connection
    ///
    /// The returned receiver yields each event serialized as JSON, after
    /// registered subscribers have run. Dropping the receiver removes the
    /// connection on the next send.
    pub fn register_websocket(&self) -> (WsConnId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = WsConnId(self.inner.next_ws_id.fetch_add(1, Ordering::Relaxed));
        let mut conns = self
            .inner
            .websockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conns.push(WsConn { id, tx });
        tracing::debug!(total = conns.len(), "Added WebSocket connection");
        (id, rx)
    }

    /// Remove a WebSocket fan-out connection
    pub fn remove_websocket(&self, id: WsConnId) {
        let mut conns = self
            .inner
            .websockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conns.retain(|c| c.id != id);
        tracing::debug!(total = conns.len(), "Removed WebSocket connection");
    }

    /// Get event history, newest last, with optional filtering
    pub fn history(
        &self,
        event_type: Option<EventType>,
        source: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| source.is_none_or(|s| e.source == s))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Clear the event history ring
    pub fn clear_history(&self) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.clear();
        tracing::info!("Event history cleared");
    }

    /// Current bus statistics
    pub fn statistics(&self) -> EventBusStats {
        let (active, wildcard) = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let wildcard = handlers
                .iter()
                .filter(|h| matches!(h.selector, Subscription::All))
                .count();
            (handlers.len() - wildcard, wildcard)
        };
        EventBusStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_handled: self.inner.events_handled.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
            active_handlers: active,
            wildcard_handlers: wildcard,
            websocket_connections: self
                .inner
                .websockets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len(),
            history_size: self
                .inner
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len(),
            active_filters: self
                .inner
                .filters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len(),
        }
    }

    /// Publish `system.shutdown` and drop all handlers and fan-out connections
    ///
    /// Delivery of the shutdown event to subscribers is best-effort.
    pub async fn shutdown(&self) {
        self.publish(
            EventType::SystemShutdown,
            "event_bus",
            serde_json::Map::new(),
            serde_json::Map::new(),
        );

        // Give the dispatcher a chance to drain before tearing down
        tokio::task::yield_now().await;

        self.inner
            .websockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        tracing::info!("Event bus shutdown complete");
    }
}

/// Dispatcher loop: invokes subscribers sequentially per event, then fans
/// out to WebSocket connections, removing any whose send fails.
async fn dispatch_loop(bus: Weak<BusInner>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };

        let matching: Vec<Arc<dyn EventSubscriber>> = {
            let handlers = inner
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers
                .iter()
                .filter(|h| h.selector.matches(event.event_type))
                .map(|h| Arc::clone(&h.subscriber))
                .collect()
        };

        for subscriber in matching {
            match subscriber.on_event(&event).await {
                Ok(()) => {
                    inner.events_handled.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        handler = subscriber.name(),
                        event_id = %event.id,
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }

        fan_out_to_websockets(&inner, &event);
    }
}

fn fan_out_to_websockets(inner: &BusInner, event: &Event) {
    let mut conns = inner
        .websockets
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if conns.is_empty() {
        return;
    }

    let message = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize event for WebSocket fan-out");
            return;
        }
    };

    conns.retain(|conn| {
        if conn.tx.send(message.clone()).is_ok() {
            true
        } else {
            tracing::debug!("WebSocket connection closed, removing from fan-out");
            false
        }
    });
}
