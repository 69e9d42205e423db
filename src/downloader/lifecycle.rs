//! Startup restore and shutdown coordination.

use super::MediaDownloader;
use super::queue::entry_for;
use crate::error::Result;
use crate::types::{PlaylistState, Status};
use std::time::Duration;

impl MediaDownloader {
    /// Restore queue state from the store on startup
    ///
    /// Non-terminal items return to memory; items found in Downloading are
    /// demoted to Pending with `started_at` cleared (their external
    /// processes did not survive the restart). Terminal items within the
    /// expiry window are kept for duplicate detection and history until
    /// purged. Playlist aggregates are rebuilt from the children's linkage.
    pub(crate) async fn restore_queue(&self) -> Result<()> {
        let persisted = self.store.load_items().await?;
        if persisted.is_empty() {
            tracing::info!("No persisted queue items to restore");
            return Ok(());
        }

        tracing::info!(count = persisted.len(), "Restoring queue from store");

        let mut demoted = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            for mut item in persisted {
                state.dedup.add_url(&item.url);
                if item.status == Status::Completed
                    && let Some(title) = &item.progress.title
                {
                    state.dedup.add_title(title);
                }

                match item.status {
                    Status::Downloading => {
                        tracing::info!(
                            item_id = %item.id,
                            "Demoting interrupted download to pending"
                        );
                        item.status = Status::Pending;
                        item.started_at = None;
                        item.progress = Default::default();
                        state.heap.push(entry_for(&item));
                        demoted.push(item.clone());
                    }
                    Status::Pending | Status::Retrying => {
                        state.heap.push(entry_for(&item));
                    }
                    // Paused items wait for an explicit resume; terminal
                    // items are history
                    Status::Paused
                    | Status::Completed
                    | Status::Failed
                    | Status::Cancelled => {}
                }

                // Rebuild playlist aggregates from child linkage
                if let Some(playlist_id) = &item.playlist_id
                    && !item.playlist_placeholder
                {
                    let playlist = state
                        .playlists
                        .entry(playlist_id.clone())
                        .or_insert_with(|| PlaylistState {
                            id: playlist_id.clone(),
                            platform: "unknown".to_string(),
                            child_ids: Vec::new(),
                            completed: 0,
                            failed: 0,
                        });
                    playlist.child_ids.push(item.id.clone());
                    match item.status {
                        Status::Completed => playlist.completed += 1,
                        Status::Failed | Status::Cancelled => playlist.failed += 1,
                        _ => {}
                    }
                }

                state.items.insert(item.id.clone(), item);
            }
        }

        // Write the demotions back so a second restart sees Pending
        for item in demoted {
            self.persist_item(&item).await;
        }

        tracing::info!("Queue restoration complete");
        Ok(())
    }

    /// Gracefully shut down the downloader
    ///
    /// 1. Stops accepting new items and halts the queue processor
    /// 2. Cancels all active workers (children terminate within the grace)
    /// 3. Waits for active downloads to drain, bounded by a timeout
    /// 4. Persists final state and publishes `system.shutdown`
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        {
            let mut state = self.state.lock().await;
            state.accepting_new = false;
            for (id, active) in state.active.iter() {
                tracing::debug!(item_id = %id, "Signalling active download for shutdown");
                active.cancel.cancel();
            }
        }
        self.shutdown_token.cancel();

        let drain_timeout = Duration::from_secs(30);
        if tokio::time::timeout(drain_timeout, self.wait_for_active_downloads())
            .await
            .is_err()
        {
            tracing::warn!("Timeout waiting for active downloads, proceeding with shutdown");
        }

        // Interrupted items persist as Pending so the next start re-queues
        // them without a demotion pass
        let interrupted: Vec<_> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let ids: Vec<_> = state
                .items
                .values()
                .filter(|item| item.status == Status::Downloading)
                .map(|item| item.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| {
                    let item = state.items.get_mut(id)?;
                    item.status = Status::Pending;
                    item.started_at = None;
                    state.bandwidth.release(id);
                    state.active.remove(id);
                    Some(item.clone())
                })
                .collect()
        };
        for item in interrupted {
            self.persist_item(&item).await;
        }

        self.bus.shutdown().await;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Wait until no download is active
    async fn wait_for_active_downloads(&self) {
        loop {
            let active = {
                let state = self.state.lock().await;
                state.active.len()
            };
            if active == 0 {
                return;
            }
            tracing::debug!(active, "Waiting for active downloads to finish");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
