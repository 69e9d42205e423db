//! Download lifecycle control — pause, resume, cancel, priority, rule commands.

use super::queue::{entry_for, non_terminal_count, settle_playlist_child};
use super::{MediaDownloader, item_event_data};
use crate::error::{Error, QueueError, Result};
use crate::events::EventType;
use crate::rules::{NotifySeverity, RuleCommand};
use crate::types::{ItemId, Priority, Status};
use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;

impl MediaDownloader {
    /// Cancel an item
    ///
    /// Valid from any non-terminal state; releases the bandwidth reservation
    /// and concurrency slot and signals the active worker, whose child
    /// process is terminated within the configured grace period. A second
    /// cancel of an already-cancelled item is Ok with no state change.
    pub async fn cancel(&self, id: &ItemId) -> Result<()> {
        self.cancel_with_reason(id, None).await
    }

    /// Cancel, recording a reason as the item's error text (rule blocks)
    pub(crate) async fn cancel_with_reason(
        &self,
        id: &ItemId,
        reason: Option<String>,
    ) -> Result<()> {
        let mut events: Vec<(EventType, serde_json::Value)> = Vec::new();

        let (item, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(item) = state.items.get_mut(id) else {
                return Err(Error::Queue(QueueError::NotFound { id: id.to_string() }));
            };

            match item.status {
                Status::Cancelled => return Ok(()), // idempotent
                Status::Completed | Status::Failed => {
                    return Err(Error::Queue(QueueError::InvalidState {
                        id: id.to_string(),
                        operation: "cancel".to_string(),
                        current_state: item.status.as_str().to_string(),
                    }));
                }
                _ => {}
            }

            // The state transition happens before the worker exits, so the
            // cancellation is observable to clients immediately
            item.status = Status::Cancelled;
            if item.completed_at.is_none() {
                item.completed_at = Some(Utc::now());
            }
            if let Some(reason) = reason {
                item.error_message = reason;
            }

            state.bandwidth.release(id);
            if let Some(active) = state.active.remove(id) {
                active.cancel.cancel();
            }

            tracing::info!(item_id = %id, url = %item.url, "Download cancelled");
            events.push((EventType::DownloadCancelled, item_event_data(item)));
            settle_playlist_child(state, id, false, &mut events);

            (
                state.items.get(id).cloned(),
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        if let Some(item) = item {
            self.persist_item(&item).await;
        }
        for (event_type, data) in events {
            self.publish_with_ambient(event_type, data, queue_size, bandwidth);
        }
        self.queue_wakeup.notify_one();
        Ok(())
    }

    /// Pause an item
    ///
    /// Valid from Pending, Retrying, or Downloading. From Downloading the
    /// active worker is signalled and the external process terminated.
    /// Pausing an already-paused item is Ok.
    pub async fn pause(&self, id: &ItemId) -> Result<()> {
        let (item, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(item) = state.items.get_mut(id) else {
                return Err(Error::Queue(QueueError::NotFound { id: id.to_string() }));
            };

            match item.status {
                Status::Paused => return Ok(()), // idempotent
                Status::Pending | Status::Retrying | Status::Downloading => {}
                _ => {
                    return Err(Error::Queue(QueueError::InvalidState {
                        id: id.to_string(),
                        operation: "pause".to_string(),
                        current_state: item.status.as_str().to_string(),
                    }));
                }
            }

            item.status = Status::Paused;
            state.bandwidth.release(id);
            if let Some(active) = state.active.remove(id) {
                active.cancel.cancel();
            }

            tracing::info!(item_id = %id, url = %item.url, "Download paused");
            (
                item.clone(),
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        self.persist_item(&item).await;
        self.publish_with_ambient(
            EventType::DownloadPaused,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );
        Ok(())
    }

    /// Resume a paused item
    ///
    /// Returns the item to Pending; re-eligibility follows normal ordering
    /// (the original creation time is kept, so it does not jump the queue).
    /// Resuming an item that is already queued or running is Ok.
    pub async fn resume(&self, id: &ItemId) -> Result<()> {
        let (item, queue_size, bandwidth) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(item) = state.items.get_mut(id) else {
                return Err(Error::Queue(QueueError::NotFound { id: id.to_string() }));
            };

            match item.status {
                Status::Paused => {}
                Status::Pending | Status::Retrying | Status::Downloading => return Ok(()),
                _ => {
                    return Err(Error::Queue(QueueError::InvalidState {
                        id: id.to_string(),
                        operation: "resume".to_string(),
                        current_state: item.status.as_str().to_string(),
                    }));
                }
            }

            item.status = Status::Pending;
            state.heap.push(entry_for(item));

            tracing::info!(item_id = %id, url = %item.url, "Download resumed");
            (
                item.clone(),
                non_terminal_count(state),
                state.bandwidth.allocated(),
            )
        };

        self.persist_item(&item).await;
        self.publish_with_ambient(
            EventType::DownloadResumed,
            item_event_data(&item),
            queue_size,
            bandwidth,
        );
        self.queue_wakeup.notify_one();
        Ok(())
    }

    /// Change an item's priority
    ///
    /// Queued items are re-ordered immediately; an active download keeps
    /// running and the new priority applies if it is ever re-queued.
    pub async fn set_priority(&self, id: &ItemId, priority: Priority) -> Result<()> {
        let item = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(item) = state.items.get_mut(id) else {
                return Err(Error::Queue(QueueError::NotFound { id: id.to_string() }));
            };

            item.priority = priority;
            // Old heap entries are now stale (priority mismatch) and will be
            // dropped at pop; push a fresh one for queued items.
            if matches!(item.status, Status::Pending | Status::Retrying) {
                state.heap.push(entry_for(item));
            }
            item.clone()
        };

        self.persist_item(&item).await;
        self.queue_wakeup.notify_one();
        Ok(())
    }

    /// Apply a progress update from the active worker
    ///
    /// The only item mutation not performed by a scheduler operation; scoped
    /// to the progress fields and ignored unless the item is Downloading.
    pub(crate) async fn update_progress(&self, id: &ItemId, update: crate::types::ProgressUpdate) {
        let data = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(item) = state.items.get_mut(id) else {
                return;
            };
            if item.status != Status::Downloading {
                return;
            }

            if let Some(bytes) = update.downloaded_bytes {
                item.progress.downloaded_bytes = bytes;
            }
            if let Some(bytes) = update.total_bytes {
                item.progress.total_bytes = bytes;
            }
            if let Some(percent) = update.percent {
                item.progress.percent = percent;
            } else if item.progress.total_bytes > 0 {
                item.progress.percent = (item.progress.downloaded_bytes as f64
                    / item.progress.total_bytes as f64
                    * 100.0) as f32;
            }
            if let Some(speed) = update.speed {
                item.progress.speed = speed;
            }
            if let Some(eta) = update.eta {
                item.progress.eta = eta;
            }
            if let Some(title) = update.title {
                item.progress.title = Some(title);
            }

            serde_json::json!({
                "item_id": item.id.as_str(),
                "url": item.url,
                "downloaded_bytes": item.progress.downloaded_bytes,
                "total_bytes": item.progress.total_bytes,
                "percent": item.progress.percent,
                "speed": item.progress.speed,
                "eta": item.progress.eta,
                "title": item.progress.title,
            })
        };

        self.publish_plain(EventType::DownloadProgress, data);
    }

    /// Spawn the task that drains rule-action commands
    ///
    /// Rule actions arrive on a channel rather than calling into the
    /// scheduler from the event dispatcher, which keeps dispatch free of
    /// re-entrancy.
    pub(crate) fn start_rule_command_task(
        &self,
        mut rx: mpsc::UnboundedReceiver<RuleCommand>,
    ) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(command) => downloader.apply_rule_command(command).await,
                        None => break,
                    },
                    _ = downloader.shutdown_token.cancelled() => break,
                }
            }
        })
    }

    /// Apply one rule command to queue state
    pub(crate) async fn apply_rule_command(&self, command: RuleCommand) {
        match command {
            RuleCommand::SetPriority { item_id, priority } => {
                if let Err(e) = self.set_priority(&item_id, priority).await {
                    tracing::warn!(item_id = %item_id, error = %e, "Rule set_priority failed");
                }
            }
            RuleCommand::SetProfile { item_id, profile } => {
                self.mutate_options(&item_id, |options| options.profile = Some(profile))
                    .await;
            }
            RuleCommand::SetQuality { item_id, quality } => {
                self.mutate_options(&item_id, |options| options.quality = quality)
                    .await;
            }
            RuleCommand::SetOutputPath { item_id, path } => {
                self.mutate_options(&item_id, |options| options.output_dir = Some(path))
                    .await;
            }
            RuleCommand::RateLimit {
                item_id,
                bytes_per_second,
            } => {
                self.mutate_options(&item_id, |options| {
                    options.bandwidth_bps = Some(bytes_per_second)
                })
                .await;
            }
            RuleCommand::Delay { item_id, minutes } => {
                self.delay_item(&item_id, minutes).await;
            }
            RuleCommand::Block { item_id, reason } => {
                if let Err(e) = self.cancel_with_reason(&item_id, Some(reason)).await {
                    tracing::warn!(item_id = %item_id, error = %e, "Rule block failed");
                }
            }
            RuleCommand::AutoOrganize { item_id, pattern } => {
                self.mutate_options(&item_id, |options| options.organize_pattern = Some(pattern))
                    .await;
            }
            RuleCommand::ExtractAudio { item_id, .. } => {
                self.mutate_options(&item_id, |options| options.extract_audio = true)
                    .await;
            }
            RuleCommand::Notify { message, severity } => match severity {
                NotifySeverity::Info => tracing::info!(message, "Rule notification"),
                NotifySeverity::Warning => tracing::warn!(message, "Rule notification"),
                NotifySeverity::Error => tracing::error!(message, "Rule notification"),
            },
        }
    }

    /// Mutate an item's options and persist; unknown ids are logged
    async fn mutate_options(
        &self,
        id: &ItemId,
        apply: impl FnOnce(&mut crate::types::DownloadOptions),
    ) {
        let item = {
            let mut guard = self.state.lock().await;
            let Some(item) = guard.items.get_mut(id) else {
                tracing::debug!(item_id = %id, "Rule command targets unknown item");
                return;
            };
            apply(&mut item.options);
            item.clone()
        };
        self.persist_item(&item).await;
    }

    /// Park a queued item on the retry clock for N minutes
    ///
    /// Uses the Retrying status so the hold is visible and inspectable, but
    /// does not consume a retry.
    async fn delay_item(&self, id: &ItemId, minutes: u32) {
        let item = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(item) = state.items.get_mut(id) else {
                return;
            };
            if !matches!(item.status, Status::Pending | Status::Retrying) {
                return;
            }
            item.status = Status::Retrying;
            item.next_attempt_at = Some(Utc::now() + TimeDelta::minutes(i64::from(minutes)));
            state.heap.push(entry_for(item));
            item.clone()
        };
        tracing::info!(item_id = %id, minutes, "Download delayed by rule");
        self.persist_item(&item).await;
    }
}
