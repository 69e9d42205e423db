//! Queue admission, ordering, completion, and snapshots.

use super::{ActiveDownload, MediaDownloader, QueuedEntry, item_event_data};
use crate::error::{Error, QueueError, Result};
use crate::events::EventType;
use crate::playlist;
use crate::types::{
    AddOutcome, DownloadOptions, FetchOutcome, ItemId, PlaylistState, Priority, QueueItem,
    QueueSnapshot, Status,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

impl MediaDownloader {
    /// Add a URL to the download queue
    ///
    /// Consults the duplicate detector first: when `skip_duplicates` is set
    /// and the normalized URL matches a tracked entry (non-terminal, or
    /// terminal within the store's expiry window), no state is mutated and
    /// [`AddOutcome::DuplicateSkipped`] is returned.
    ///
    /// Emits `queue.item_added` followed by `download.queued` before
    /// returning.
    pub async fn add(
        &self,
        url: &str,
        priority: Priority,
        options: DownloadOptions,
        skip_duplicates: bool,
    ) -> Result<AddOutcome> {
        self.add_internal(url, priority, options, skip_duplicates, None)
            .await
    }

    /// Add a URL, attaching playlist linkage when `playlist` is set
    pub(crate) async fn add_internal(
        &self,
        url: &str,
        priority: Priority,
        options: DownloadOptions,
        skip_duplicates: bool,
        playlist: Option<(String, u32, bool)>,
    ) -> Result<AddOutcome> {
        let (item, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if !state.accepting_new {
                return Err(Error::ShuttingDown);
            }

            if skip_duplicates && state.dedup.is_known_url(url) {
                state.counters.duplicates_skipped += 1;
                tracing::info!(url, "Skipping duplicate URL");
                return Ok(AddOutcome::DuplicateSkipped);
            }

            let mut item = QueueItem::new(url, priority, options, self.config.retry.max_retries);
            match playlist {
                Some((playlist_id, index, placeholder)) => {
                    item.playlist_id = Some(playlist_id);
                    item.playlist_index = Some(index);
                    item.playlist_placeholder = placeholder;
                }
                None => {
                    // Record playlist identity even for single adds so rules
                    // and clients can see the linkage
                    if let Some(detected) = playlist::detect_playlist(url) {
                        item.playlist_id = Some(detected.id);
                    }
                }
            }

            state.heap.push(entry_for(&item));
            state.dedup.add_url(url);
            state.counters.total_added += 1;
            state.items.insert(item.id.clone(), item.clone());

            tracing::info!(
                item_id = %item.id,
                url,
                priority = ?priority,
                "Added to queue"
            );

            (item, non_terminal_count(state), state.bandwidth.allocated())
        };

        self.persist_item(&item).await;
        self.publish_with_ambient(
            EventType::QueueItemAdded,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );
        self.publish_with_ambient(
            EventType::DownloadQueued,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );
        self.queue_wakeup.notify_one();

        Ok(AddOutcome::Added(item.id))
    }

    /// Add a playlist URL
    ///
    /// A URL the playlist detector recognizes inserts one placeholder item;
    /// expansion into children happens at admission, when the selected
    /// engine lists the playlist entries. Unrecognized URLs behave exactly
    /// like [`add`](Self::add).
    pub async fn add_playlist(
        &self,
        url: &str,
        priority: Priority,
        options: DownloadOptions,
    ) -> Result<Vec<ItemId>> {
        let outcome = match playlist::detect_playlist(url) {
            Some(detected) => {
                self.add_internal(
                    url,
                    priority,
                    options,
                    true,
                    Some((detected.id, 0, true)),
                )
                .await?
            }
            None => self.add(url, priority, options, true).await?,
        };

        Ok(match outcome {
            AddOutcome::Added(id) => vec![id],
            AddOutcome::DuplicateSkipped => Vec::new(),
        })
    }

    /// Return the next admittable item, if any
    ///
    /// Non-blocking. The returned item has been transitioned to Downloading
    /// with its bandwidth reservation and concurrency slot taken, and
    /// `download.started` has been emitted. Most callers want the worker
    /// loop instead; this is the raw scheduler operation.
    pub async fn next(&self) -> Option<QueueItem> {
        self.admit_next().await.map(|(item, _token)| item)
    }

    /// Admission: pick, gate, and transition the next item
    pub(crate) async fn admit_next(&self) -> Option<(QueueItem, CancellationToken)> {
        let (item, token, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.active.len() >= self.config.queue.max_concurrent_downloads {
                return None;
            }

            let now = Utc::now();
            // Entries set aside during this scan (future retry clocks, or a
            // bandwidth miss); re-pushed before returning so they keep their
            // place without being reordered.
            let mut deferred: Vec<QueuedEntry> = Vec::new();
            let mut admitted: Option<(QueueItem, CancellationToken)> = None;

            while let Some(entry) = state.heap.pop() {
                let Some(item) = state.items.get(&entry.id) else {
                    continue; // removed or purged
                };
                if state.active.contains_key(&entry.id) {
                    continue;
                }
                if entry.priority != item.priority {
                    continue; // stale entry from before a priority change
                }
                match item.status {
                    Status::Pending => {}
                    Status::Retrying => {
                        let clock_elapsed = item.next_attempt_at.is_none_or(|at| now >= at);
                        if !clock_elapsed {
                            deferred.push(entry);
                            continue;
                        }
                    }
                    _ => continue, // paused or terminal entries are stale
                }

                let amount = item
                    .options
                    .bandwidth_bps
                    .unwrap_or(self.config.queue.default_item_bandwidth_bps);
                if !state.bandwidth.can_allocate(&entry.id, amount) {
                    // Gate miss leaves the item in place, not reordered
                    deferred.push(entry);
                    break;
                }

                let id = entry.id.clone();
                state.bandwidth.allocate(&id, amount);
                let token = CancellationToken::new();
                state.active.insert(
                    id.clone(),
                    ActiveDownload {
                        cancel: token.clone(),
                    },
                );

                if let Some(item) = state.items.get_mut(&id) {
                    item.status = Status::Downloading;
                    item.bandwidth_bps = Some(amount);
                    if item.started_at.is_none() {
                        item.started_at = Some(now);
                    }
                    admitted = Some((item.clone(), token));
                }
                break;
            }

            for entry in deferred {
                state.heap.push(entry);
            }

            let (item, token) = admitted?;
            (
                item,
                token,
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        tracing::info!(item_id = %item.id, url = %item.url, "Admitted for download");
        self.persist_item(&item).await;
        self.publish_with_ambient(
            EventType::DownloadStarted,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );

        Some((item, token))
    }

    /// Record the result of a fetch
    ///
    /// Public form of the completion operation: success finalizes the item,
    /// failure consults the retry policy. Workers use
    /// [`finish_fetch`](Self::finish_fetch) with the full engine outcome.
    pub async fn complete(&self, id: &ItemId, success: bool, error_text: &str) -> Result<()> {
        let engine = {
            let state = self.state.lock().await;
            let item = state
                .items
                .get(id)
                .ok_or_else(|| Error::Queue(QueueError::NotFound { id: id.to_string() }))?;
            item.engine.unwrap_or(crate::types::EngineKind::YtDlpAria2)
        };

        let outcome = if success {
            FetchOutcome::success(engine)
        } else {
            FetchOutcome::error(engine, error_text)
        };
        self.finish_fetch(id, outcome).await;
        Ok(())
    }

    /// Apply an engine outcome to a downloading item
    ///
    /// No-op when the item is no longer in Downloading (user cancelled or
    /// paused mid-run; resources were already released on that path).
    pub(crate) async fn finish_fetch(&self, id: &ItemId, outcome: FetchOutcome) {
        let mut events: Vec<(EventType, serde_json::Value)> = Vec::new();

        let (persist, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(item) = state.items.get_mut(id) else {
                return;
            };
            if item.status != Status::Downloading {
                return;
            }

            state.bandwidth.release(id);
            state.active.remove(id);

            if outcome.success {
                item.status = Status::Completed;
                if item.completed_at.is_none() {
                    item.completed_at = Some(Utc::now());
                }
                if let Some(title) = &outcome.title {
                    item.progress.title = Some(title.clone());
                    state.dedup.add_title(title);
                }
                item.error_message.clear();
                state.counters.total_completed += 1;

                tracing::info!(item_id = %id, url = %item.url, "Download completed");
                let mut data = item_event_data(item);
                if let Some(path) = &outcome.output_path {
                    data["output_path"] = serde_json::json!(path.display().to_string());
                }
                if let Some(count) = outcome.file_count {
                    data["file_count"] = serde_json::json!(count);
                }
                data["engine"] = serde_json::json!(outcome.engine.as_str());
                events.push((EventType::DownloadCompleted, data));

                settle_playlist_child(state, id, true, &mut events);
            } else {
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string());
                item.error_message = message.clone();

                if !outcome.permanent && self.retry_policy.has_budget(item) {
                    self.retry_policy.schedule_retry(item);
                    item.status = Status::Retrying;
                    state.heap.push(entry_for(item));
                } else {
                    item.status = Status::Failed;
                    if item.completed_at.is_none() {
                        item.completed_at = Some(Utc::now());
                    }
                    state.counters.total_failed += 1;

                    tracing::warn!(
                        item_id = %id,
                        url = %item.url,
                        error = %message,
                        permanent = outcome.permanent,
                        "Download failed"
                    );
                    let mut data = item_event_data(item);
                    data["error"] = serde_json::json!(message);
                    data["engine"] = serde_json::json!(outcome.engine.as_str());
                    events.push((EventType::DownloadFailed, data));

                    settle_playlist_child(state, id, false, &mut events);
                }
            }

            (
                state.items.get(id).cloned(),
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        if let Some(item) = persist {
            self.persist_item(&item).await;
        }
        for (event_type, data) in events {
            self.publish_with_ambient(event_type, data, queue_size, bandwidth);
        }
        self.queue_wakeup.notify_one();
    }

    /// Re-admit a terminal item (user-initiated retry)
    ///
    /// Starts a fresh admission cycle from Pending, preserving
    /// `retry_count`; the timing fields reset for the new cycle.
    pub async fn retry(&self, id: &ItemId) -> Result<()> {
        let (item, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let item = state
                .items
                .get_mut(id)
                .ok_or_else(|| Error::Queue(QueueError::NotFound { id: id.to_string() }))?;

            if !item.status.is_terminal() {
                return Err(Error::Queue(QueueError::InvalidState {
                    id: id.to_string(),
                    operation: "retry".to_string(),
                    current_state: item.status.as_str().to_string(),
                }));
            }

            item.status = Status::Pending;
            item.started_at = None;
            item.completed_at = None;
            item.next_attempt_at = None;
            item.error_message.clear();
            state.heap.push(entry_for(item));
            (
                item.clone(),
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        self.persist_item(&item).await;
        self.publish_with_ambient(
            EventType::QueueStatusChanged,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );
        self.queue_wakeup.notify_one();
        Ok(())
    }

    /// Point-in-time queue snapshot
    pub async fn status(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let mut status_counts = std::collections::BTreeMap::new();
        for item in state.items.values() {
            *status_counts
                .entry(item.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        QueueSnapshot {
            total_items: state.items.len(),
            active_downloads: state.active.len(),
            queue_depth: state.heap.len(),
            status_counts,
            bandwidth: state.bandwidth.snapshot(),
            statistics: state.counters.clone(),
        }
    }

    /// Fetch a single item
    pub async fn get_item(&self, id: &ItemId) -> Result<QueueItem> {
        let state = self.state.lock().await;
        state
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Queue(QueueError::NotFound { id: id.to_string() }))
    }

    /// All tracked items, optionally filtered by status
    pub async fn list_items(&self, status: Option<Status>) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| status.is_none_or(|s| item.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Remove all terminal items (and their settled playlists)
    ///
    /// Returns how many items were purged. Emits `queue.cleared`.
    pub async fn purge_completed(&self) -> Result<usize> {
        let (purged, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let terminal: Vec<ItemId> = state
                .items
                .values()
                .filter(|item| item.is_terminal())
                .map(|item| item.id.clone())
                .collect();
            for id in &terminal {
                state.items.remove(id);
            }
            state
                .playlists
                .retain(|_, playlist| !playlist.is_settled());

            (
                terminal,
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        for id in &purged {
            if let Err(e) = self.store.delete_item(id).await {
                tracing::warn!(item_id = %id, error = %e, "Failed to delete purged item record");
            }
        }
        self.store.purge_expired().await.ok();

        self.publish_with_ambient(
            EventType::QueueCleared,
            serde_json::json!({ "purged": purged.len() }),
            queue_size,
            bandwidth,
        );
        Ok(purged.len())
    }

    /// Write an item record through to the store
    ///
    /// Persistence is best-effort: failures are logged and surfaced as
    /// `system.error`, never propagated into queue mutations.
    pub(crate) async fn persist_item(&self, item: &QueueItem) {
        if let Err(e) = self.store.put_item(item).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to persist queue item");
            self.publish_plain(
                EventType::SystemError,
                serde_json::json!({
                    "error": e.to_string(),
                    "context": "queue item persistence",
                    "item_id": item.id.as_str(),
                }),
            );
        }
    }
}

/// Heap entry snapshot for an item
pub(crate) fn entry_for(item: &QueueItem) -> QueuedEntry {
    QueuedEntry {
        id: item.id.clone(),
        priority: item.priority,
        created_at_nanos: item.created_at.timestamp_nanos_opt().unwrap_or_default(),
    }
}

/// Items not yet in a terminal state (the rules engine's "queue size")
pub(crate) fn non_terminal_count(state: &super::SchedulerState) -> usize {
    state.items.values().filter(|i| !i.is_terminal()).count()
}

/// Update playlist aggregates when a child settles; queues playlist events
pub(crate) fn settle_playlist_child(
    state: &mut super::SchedulerState,
    id: &ItemId,
    success: bool,
    events: &mut Vec<(EventType, serde_json::Value)>,
) {
    let Some(item) = state.items.get(id) else {
        return;
    };
    if item.playlist_placeholder {
        return;
    }
    let Some(playlist_id) = item.playlist_id.clone() else {
        return;
    };
    let Some(playlist) = state.playlists.get_mut(&playlist_id) else {
        return;
    };

    if success {
        playlist.completed += 1;
    } else {
        playlist.failed += 1;
    }

    events.push((
        EventType::PlaylistItemCompleted,
        serde_json::json!({
            "playlist_id": playlist.id,
            "item_id": id.as_str(),
            "success": success,
            "completed": playlist.completed,
            "failed": playlist.failed,
            "total": playlist.total(),
        }),
    ));

    if playlist.is_settled() {
        let event_type = if playlist.failed == 0 {
            EventType::PlaylistCompleted
        } else {
            EventType::PlaylistFailed
        };
        events.push((
            event_type,
            serde_json::json!({
                "playlist_id": playlist.id,
                "completed": playlist.completed,
                "failed": playlist.failed,
                "total": playlist.total(),
            }),
        ));
    }
}

/// Register a playlist aggregate at expansion time
pub(crate) fn register_playlist(
    state: &mut super::SchedulerState,
    id: &str,
    platform: &str,
    child_ids: Vec<ItemId>,
) {
    state.playlists.insert(
        id.to_string(),
        PlaylistState {
            id: id.to_string(),
            platform: platform.to_string(),
            child_ids,
            completed: 0,
            failed: 0,
        },
    );
}
