//! Queue processor — admits items and drives engine adapters.
//!
//! One background task pulls admittable items from the scheduler and spawns
//! a worker per item. Each worker owns exactly one engine run (and so one
//! external child process), forwards normalized progress into the scheduler,
//! and reports the outcome back through [`finish_fetch`].
//!
//! [`finish_fetch`]: super::MediaDownloader::finish_fetch

use super::queue::register_playlist;
use super::{MediaDownloader, item_event_data};
use crate::events::EventType;
use crate::playlist;
use crate::types::{
    DownloadOptions, EngineKind, FetchOutcome, FetchRequest, ItemId, QueueItem,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interval between queue polling attempts when nothing is admittable
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl MediaDownloader {
    /// Start the queue processor task
    ///
    /// The processor loops: admit the next item (respecting the concurrency
    /// and bandwidth gates), spawn a worker for it, repeat. When nothing is
    /// admittable it sleeps briefly or until woken by an add, resume, or
    /// completion.
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        tokio::spawn(async move {
            loop {
                if downloader.shutdown_token.is_cancelled() {
                    break;
                }

                match downloader.admit_next().await {
                    Some((item, cancel)) => {
                        let worker = downloader.clone();
                        tokio::spawn(async move {
                            worker.run_fetch_task(item, cancel).await;
                        });
                    }
                    None => {
                        tokio::select! {
                            _ = downloader.queue_wakeup.notified() => {}
                            _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                            _ = downloader.shutdown_token.cancelled() => break,
                        }
                    }
                }
            }
            tracing::debug!("Queue processor stopped");
        })
    }

    /// Drive one admitted item to completion
    pub(crate) async fn run_fetch_task(&self, item: QueueItem, cancel: CancellationToken) {
        // Playlist placeholders expand instead of fetching
        if item.playlist_placeholder {
            self.expand_playlist_item(item).await;
            return;
        }

        let Some(engine) = self
            .engines
            .select(&item.url, item.options.preferred_engine)
        else {
            tracing::warn!(item_id = %item.id, url = %item.url, "No engine available for URL");
            self.publish_plain(
                EventType::EngineError,
                serde_json::json!({
                    "item_id": item.id.as_str(),
                    "url": item.url,
                    "error": "no engine available",
                }),
            );
            self.finish_fetch(
                &item.id,
                FetchOutcome::permanent_error(
                    EngineKind::YtDlpAria2,
                    format!("no engine available for URL: {}", item.url),
                ),
            )
            .await;
            return;
        };

        self.record_engine_selection(&item.id, engine.kind()).await;
        self.publish_plain(
            EventType::EngineSelected,
            serde_json::json!({
                "item_id": item.id.as_str(),
                "url": item.url,
                "engine": engine.kind().as_str(),
            }),
        );

        // Progress flows over a channel into the scheduler; the forwarder
        // ends when the adapter drops its sender
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let forwarder = {
            let downloader = self.clone();
            let item_id = item.id.clone();
            tokio::spawn(async move {
                while let Some(update) = progress_rx.recv().await {
                    downloader.update_progress(&item_id, update).await;
                }
            })
        };

        let request = self.fetch_request_for(&item);
        let outcome = self
            .run_with_timeout(engine, request, progress_tx, cancel)
            .await;

        forwarder.await.ok();
        self.finish_fetch(&item.id, outcome).await;
    }

    /// Run the adapter, enforcing the scheduler's hard per-item ceiling
    ///
    /// A timeout surfaces as a transient failure (retry policy applies),
    /// not a cancellation. The child is torn down through the same
    /// cancellation path the user-facing cancel uses.
    async fn run_with_timeout(
        &self,
        engine: Arc<dyn crate::engines::Engine>,
        request: FetchRequest,
        progress: crate::engines::ProgressSink,
        cancel: CancellationToken,
    ) -> FetchOutcome {
        let hard_timeout = self.config.queue.hard_item_timeout_seconds;
        let engine_kind = engine.kind();
        let grace = request.grace_seconds;

        let run = engine.run(request, progress, cancel.clone());
        tokio::pin!(run);

        if hard_timeout == 0 {
            return run.await;
        }

        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(Duration::from_secs(hard_timeout)) => {
                tracing::warn!(timeout_seconds = hard_timeout, "Hard item timeout exceeded");
                cancel.cancel();
                // Give the adapter the grace window (plus slack) to tear the
                // child down and return before abandoning it
                tokio::time::timeout(Duration::from_secs(grace + 2), &mut run)
                    .await
                    .ok();
                FetchOutcome::error(
                    engine_kind,
                    format!("hard timeout after {hard_timeout}s"),
                )
            }
        }
    }

    /// Build the adapter request for an item
    fn fetch_request_for(&self, item: &QueueItem) -> FetchRequest {
        let options: &DownloadOptions = &item.options;
        FetchRequest {
            item_id: item.id.clone(),
            url: item.url.clone(),
            output_dir: options
                .output_dir
                .clone()
                .unwrap_or_else(|| self.config.queue.download_dir.clone()),
            quality: options.quality.clone(),
            bandwidth_bps: item.bandwidth_bps,
            extract_audio: options.extract_audio,
            write_subtitles: options.write_subtitles,
            write_thumbnail: options.write_thumbnail,
            grace_seconds: self.config.queue.grace_seconds_on_cancel,
        }
    }

    /// Record the router's choice on the item
    async fn record_engine_selection(&self, id: &ItemId, engine: EngineKind) {
        let item = {
            let mut guard = self.state.lock().await;
            let Some(item) = guard.items.get_mut(id) else {
                return;
            };
            item.engine = Some(engine);
            item.clone()
        };
        self.persist_item(&item).await;
    }

    /// Expand a playlist placeholder into individually-admitted children
    ///
    /// The first engine call lists the playlist entries; each child is then
    /// added with the placeholder's priority and options, linked to the
    /// playlist. The placeholder completes once expansion succeeds and fails
    /// when it produces nothing.
    async fn expand_playlist_item(&self, item: QueueItem) {
        let Some(playlist_id) = item.playlist_id.clone() else {
            // A placeholder without an id cannot expand
            self.finish_fetch(
                &item.id,
                FetchOutcome::permanent_error(EngineKind::YtDlpAria2, "playlist id missing"),
            )
            .await;
            return;
        };
        let platform = playlist::detect_playlist(&item.url)
            .map(|p| p.platform)
            .unwrap_or("unknown");

        let Some(engine) = self
            .engines
            .select(&item.url, item.options.preferred_engine)
        else {
            self.finish_fetch(
                &item.id,
                FetchOutcome::permanent_error(
                    EngineKind::YtDlpAria2,
                    format!("no engine available for playlist URL: {}", item.url),
                ),
            )
            .await;
            return;
        };

        let entries = match engine.expand_playlist(&item.url).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "Playlist expansion failed");
                self.finish_fetch(&item.id, FetchOutcome::error(engine.kind(), e.to_string()))
                    .await;
                return;
            }
        };

        if entries.is_empty() {
            self.finish_fetch(
                &item.id,
                FetchOutcome::permanent_error(
                    engine.kind(),
                    "playlist expansion produced no entries",
                ),
            )
            .await;
            return;
        }

        let total = entries.len();
        self.publish_plain(
            EventType::PlaylistStarted,
            serde_json::json!({
                "playlist_id": playlist_id,
                "platform": platform,
                "url": item.url,
                "total": total,
            }),
        );

        let mut child_ids = Vec::with_capacity(total);
        for (index, url) in entries.into_iter().enumerate() {
            match self
                .add_internal(
                    &url,
                    item.priority,
                    item.options.clone(),
                    true,
                    Some((playlist_id.clone(), index as u32, false)),
                )
                .await
            {
                Ok(crate::types::AddOutcome::Added(id)) => child_ids.push(id),
                Ok(crate::types::AddOutcome::DuplicateSkipped) => {}
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to add playlist child");
                }
            }
        }

        {
            let mut guard = self.state.lock().await;
            register_playlist(&mut guard, &playlist_id, platform, child_ids.clone());
        }

        tracing::info!(
            playlist_id = %playlist_id,
            children = child_ids.len(),
            "Playlist expanded"
        );

        let mut outcome = FetchOutcome::success(engine.kind());
        outcome.file_count = Some(child_ids.len() as u64);
        self.finish_fetch(&item.id, outcome).await;

        // Make the expansion visible as an item event too
        if let Ok(placeholder) = self.get_item(&item.id).await {
            self.publish_plain(EventType::QueueStatusChanged, item_event_data(&placeholder));
        }
    }
}
