//! Core downloader implementation split into focused submodules.
//!
//! The `MediaDownloader` struct and its methods are organized by domain:
//! - [`queue`] - Admission, ordering, completion, snapshots
//! - [`control`] - Lifecycle control (pause/resume/cancel, rule commands)
//! - [`queue_processor`] - Worker loop driving engine adapters
//! - [`lifecycle`] - Startup restore and shutdown coordination
//!
//! All mutable queue state lives in a single [`SchedulerState`] behind one
//! mutex — the scheduler actor. Queue mutations go through methods that take
//! that lock; workers report back by calling those methods, never the other
//! way around. Event subscribers post [`RuleCommand`]s on a channel instead
//! of re-entering the scheduler.

mod control;
mod lifecycle;
mod queue;
mod queue_processor;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::bandwidth::BandwidthLedger;
use crate::config::Config;
use crate::dedup::DuplicateDetector;
use crate::engines::EngineRegistry;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::retry::RetryPolicy;
use crate::rules::{RuleCommand, RulesEngine};
use crate::store::QueueStore;
use crate::types::{ItemId, PlaylistState, Priority, QueueCounters, QueueItem};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Entry in the admission heap
///
/// A snapshot of (priority, created_at) at push time; entries whose snapshot
/// no longer matches the item are stale and dropped at pop. Ordering is
/// priority descending, then created_at ascending (FIFO), then id ascending
/// for identical creation instants under coarse clocks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct QueuedEntry {
    pub(crate) id: ItemId,
    pub(crate) priority: Priority,
    pub(crate) created_at_nanos: i64,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first; FIFO within a priority (older
        // timestamp wins, so the comparison is reversed); ids tie-break.
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => match other.created_at_nanos.cmp(&self.created_at_nanos) {
                std::cmp::Ordering::Equal => other.id.cmp(&self.id),
                ordering => ordering,
            },
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An admitted download tracked by the scheduler
pub(crate) struct ActiveDownload {
    pub(crate) cancel: CancellationToken,
}

/// All mutable queue state, owned by the scheduler actor
pub(crate) struct SchedulerState {
    /// Every tracked item, including terminal ones until purged
    pub(crate) items: HashMap<ItemId, QueueItem>,
    /// Admission ordering
    pub(crate) heap: BinaryHeap<QueuedEntry>,
    /// Items currently in Downloading, with their cancellation tokens
    pub(crate) active: HashMap<ItemId, ActiveDownload>,
    /// Bandwidth reservation ledger
    pub(crate) bandwidth: BandwidthLedger,
    /// URL/title duplicate sets
    pub(crate) dedup: DuplicateDetector,
    /// Playlist aggregates by playlist id
    pub(crate) playlists: HashMap<String, PlaylistState>,
    /// Lifetime statistics
    pub(crate) counters: QueueCounters,
    /// Cleared during shutdown
    pub(crate) accepting_new: bool,
}

impl SchedulerState {
    fn new(bandwidth_cap: Option<u64>) -> Self {
        Self {
            items: HashMap::new(),
            heap: BinaryHeap::new(),
            active: HashMap::new(),
            bandwidth: BandwidthLedger::new(bandwidth_cap),
            dedup: DuplicateDetector::new(),
            playlists: HashMap::new(),
            counters: QueueCounters::default(),
            accepting_new: true,
        }
    }
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct MediaDownloader {
    /// Queue persistence adapter
    pub(crate) store: Arc<QueueStore>,
    /// Event bus
    pub(crate) bus: EventBus,
    /// Configuration
    pub(crate) config: Arc<Config>,
    /// Engine registry and router
    pub(crate) engines: Arc<EngineRegistry>,
    /// Rules engine
    pub(crate) rules: Arc<RulesEngine>,
    /// Retry/backoff policy
    pub(crate) retry_policy: RetryPolicy,
    /// The scheduler actor's state
    pub(crate) state: Arc<tokio::sync::Mutex<SchedulerState>>,
    /// Wakes the queue processor after adds, resumes, and completions
    pub(crate) queue_wakeup: Arc<Notify>,
    /// Cancelled once at shutdown
    pub(crate) shutdown_token: CancellationToken,
}

impl MediaDownloader {
    /// Create a new MediaDownloader instance
    ///
    /// Validates configuration, opens (or degrades) the queue store,
    /// constructs the engine registry with availability probing, wires the
    /// rules engine to the event bus, restores persisted queue state, and
    /// starts the queue processor.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let engines = Arc::new(EngineRegistry::new(&config.engines));
        Self::with_parts(config, engines, None).await
    }

    /// Construct with an explicit engine registry and optional store
    ///
    /// Used by tests and embedders that inject stub engines or share a
    /// store. A `None` store follows the configuration (URL or in-memory,
    /// degrading on connection failure).
    pub async fn with_parts(
        config: Config,
        engines: Arc<EngineRegistry>,
        store: Option<Arc<QueueStore>>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.queue.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.queue.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let bus = EventBus::new(config.events.history_capacity);

        // Store unavailability degrades to in-memory rather than failing
        let ttl_days = config.persistence.terminal_ttl_days;
        let mut store_error: Option<String> = None;
        let store = match store {
            Some(store) => store,
            None => match &config.persistence.queue_store_url {
                Some(url) => match QueueStore::open(url, ttl_days).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        tracing::error!(error = %e, url = %url, "Queue store unreachable, degrading to in-memory");
                        store_error = Some(e.to_string());
                        Arc::new(QueueStore::in_memory(ttl_days))
                    }
                },
                None => Arc::new(QueueStore::in_memory(ttl_days)),
            },
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel::<RuleCommand>();
        let rules = Arc::new(RulesEngine::new(command_tx));
        if let Err(e) = rules.load_from_file(&config.persistence.rules_file).await {
            tracing::warn!(error = %e, "Failed to load rules document, starting empty");
        }
        bus.subscribe_handler(RulesEngine::subscription(), rules.clone());

        let state = Arc::new(tokio::sync::Mutex::new(SchedulerState::new(
            config.queue.bandwidth_cap_bps,
        )));

        let retry_policy = RetryPolicy::new(&config.retry);
        let downloader = Self {
            store,
            bus,
            config: Arc::new(config),
            engines,
            rules,
            retry_policy,
            state,
            queue_wakeup: Arc::new(Notify::new()),
            shutdown_token: CancellationToken::new(),
        };

        downloader.restore_queue().await?;
        let _ = downloader.start_rule_command_task(command_rx);
        let _ = downloader.start_queue_processor();

        downloader.publish_plain(
            EventType::SystemStartup,
            serde_json::json!({
                "persistent_store": downloader.store.is_persistent(),
            }),
        );
        if let Some(error) = store_error {
            downloader.publish_plain(
                EventType::SystemError,
                serde_json::json!({
                    "error": error,
                    "context": "queue store degraded to in-memory",
                }),
            );
        }

        Ok(downloader)
    }

    /// Subscribe to all events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently in publish order.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::events::Event> {
        self.bus.subscribe()
    }

    /// The event bus handle
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The rules engine handle
    pub fn rules(&self) -> &Arc<RulesEngine> {
        &self.rules
    }

    /// The engine registry handle
    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Publish an event with ambient queue facts in the metadata
    ///
    /// The rules engine reads `queue_size` and `bandwidth_usage` from event
    /// metadata, so scheduler call sites stamp them from the state they
    /// already hold.
    pub(crate) fn publish_with_ambient(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        queue_size: usize,
        bandwidth_usage: u64,
    ) {
        let metadata = crate::events::payload(serde_json::json!({
            "queue_size": queue_size,
            "bandwidth_usage": bandwidth_usage,
        }));
        self.bus.publish(
            event_type,
            "scheduler",
            crate::events::payload(data),
            metadata,
        );
    }

    /// Publish an event without ambient metadata
    pub(crate) fn publish_plain(&self, event_type: EventType, data: serde_json::Value) {
        self.bus.publish(
            event_type,
            "scheduler",
            crate::events::payload(data),
            serde_json::Map::new(),
        );
    }

    /// Spawn the REST API server in a background task
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let downloader = self.clone();
        let config = self.config.clone();
        tokio::spawn(async move { crate::api::start_api_server(downloader, config).await })
    }
}

/// Event payload for an item's lifecycle events
pub(crate) fn item_event_data(item: &QueueItem) -> serde_json::Value {
    serde_json::json!({
        "item_id": item.id.as_str(),
        "url": item.url,
        "priority": item.priority,
        "status": item.status.as_str(),
        "title": item.progress.title,
        "playlist_id": item.playlist_id,
        "retry_count": item.retry_count,
    })
}
