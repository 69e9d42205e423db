use crate::downloader::test_helpers::{StubEngine, build_downloader, test_config};
use crate::engines::Engine;
use crate::error::{Error, QueueError};
use crate::rules::{NotifySeverity, RuleCommand};
use crate::types::{DownloadOptions, EngineKind, ItemId, Priority, Status};
use std::sync::Arc;

fn stub() -> Arc<dyn Engine> {
    Arc::new(StubEngine::new(EngineKind::YtDlpAria2))
}

async fn added(dl: &crate::MediaDownloader, url: &str, priority: Priority) -> ItemId {
    dl.add(url, priority, DownloadOptions::default(), true)
        .await
        .unwrap()
        .item_id()
        .cloned()
        .unwrap()
}

// --- cancel ---

#[tokio::test]
async fn cancel_pending_item_releases_nothing_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.cancel(&id).await.unwrap();
    let item = dl.get_item(&id).await.unwrap();
    assert_eq!(item.status, Status::Cancelled);
    assert!(item.completed_at.is_some());
    assert!(dl.next().await.is_none(), "cancelled item is not admittable");
}

#[tokio::test]
async fn cancel_downloading_item_releases_slot_and_bandwidth() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;
    dl.next().await.unwrap();

    dl.cancel(&id).await.unwrap();

    let snapshot = dl.status().await;
    assert_eq!(snapshot.active_downloads, 0);
    assert_eq!(snapshot.bandwidth.allocated_bps, 0);
    assert_eq!(dl.get_item(&id).await.unwrap().status, Status::Cancelled);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.cancel(&id).await.unwrap();
    let first = dl.get_item(&id).await.unwrap();

    dl.cancel(&id).await.unwrap();
    let second = dl.get_item(&id).await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(
        first.completed_at, second.completed_at,
        "second cancel must not change state"
    );
}

#[tokio::test]
async fn cancel_of_completed_item_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;
    dl.next().await.unwrap();
    dl.complete(&id, true, "").await.unwrap();

    let result = dl.cancel(&id).await;
    assert!(matches!(
        result,
        Err(Error::Queue(QueueError::InvalidState { .. }))
    ));
}

// --- pause / resume ---

#[tokio::test]
async fn pause_then_resume_returns_to_pending() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.pause(&id).await.unwrap();
    assert_eq!(dl.get_item(&id).await.unwrap().status, Status::Paused);

    dl.resume(&id).await.unwrap();
    let item = dl.get_item(&id).await.unwrap();
    assert_eq!(
        item.status,
        Status::Pending,
        "pause;resume lands back where a pending item would be"
    );
    assert!(item.started_at.is_none());
}

#[tokio::test]
async fn pause_downloading_releases_resources() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;
    dl.next().await.unwrap();

    dl.pause(&id).await.unwrap();

    let snapshot = dl.status().await;
    assert_eq!(snapshot.active_downloads, 0);
    assert_eq!(snapshot.bandwidth.allocated_bps, 0);
}

#[tokio::test]
async fn pause_is_idempotent_and_resume_of_active_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.pause(&id).await.unwrap();
    dl.pause(&id).await.unwrap();
    dl.resume(&id).await.unwrap();
    dl.resume(&id).await.unwrap();
    assert_eq!(dl.get_item(&id).await.unwrap().status, Status::Pending);
}

#[tokio::test]
async fn pause_of_terminal_item_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;
    dl.cancel(&id).await.unwrap();

    assert!(matches!(
        dl.pause(&id).await,
        Err(Error::Queue(QueueError::InvalidState { .. }))
    ));
    assert!(matches!(
        dl.resume(&id).await,
        Err(Error::Queue(QueueError::InvalidState { .. }))
    ));
}

#[tokio::test]
async fn resumed_item_does_not_jump_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.queue.max_concurrent_downloads = 10;
    let dl = build_downloader(config, vec![stub()], false).await;

    let first = added(&dl, "https://host.example/v/1", Priority::Normal).await;
    let second = added(&dl, "https://host.example/v/2", Priority::Normal).await;

    // Pause and resume the first; its original creation time keeps it first
    dl.pause(&first).await.unwrap();
    dl.resume(&first).await.unwrap();

    assert_eq!(dl.next().await.unwrap().id, first);
    assert_eq!(dl.next().await.unwrap().id, second);
}

// --- set_priority ---

#[tokio::test]
async fn set_priority_reorders_queued_items() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.queue.max_concurrent_downloads = 10;
    let dl = build_downloader(config, vec![stub()], false).await;

    let first = added(&dl, "https://host.example/v/1", Priority::Normal).await;
    let second = added(&dl, "https://host.example/v/2", Priority::Normal).await;

    dl.set_priority(&second, Priority::Urgent).await.unwrap();

    assert_eq!(dl.next().await.unwrap().id, second, "raised priority wins");
    assert_eq!(dl.next().await.unwrap().id, first);
}

#[tokio::test]
async fn set_priority_unknown_item_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    assert!(matches!(
        dl.set_priority(&ItemId::new("ghost"), Priority::High).await,
        Err(Error::Queue(QueueError::NotFound { .. }))
    ));
}

// --- rule commands ---

#[tokio::test]
async fn rule_commands_mutate_item_options() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Low).await;

    dl.apply_rule_command(RuleCommand::SetPriority {
        item_id: id.clone(),
        priority: Priority::Urgent,
    })
    .await;
    dl.apply_rule_command(RuleCommand::SetQuality {
        item_id: id.clone(),
        quality: "best[height<=720]".into(),
    })
    .await;
    dl.apply_rule_command(RuleCommand::RateLimit {
        item_id: id.clone(),
        bytes_per_second: 500_000,
    })
    .await;
    dl.apply_rule_command(RuleCommand::ExtractAudio {
        item_id: id.clone(),
        format: "mp3".into(),
    })
    .await;
    dl.apply_rule_command(RuleCommand::AutoOrganize {
        item_id: id.clone(),
        pattern: "{uploader}/{title}".into(),
    })
    .await;

    let item = dl.get_item(&id).await.unwrap();
    assert_eq!(item.priority, Priority::Urgent);
    assert_eq!(item.options.quality, "best[height<=720]");
    assert_eq!(item.options.bandwidth_bps, Some(500_000));
    assert!(item.options.extract_audio);
    assert_eq!(item.options.organize_pattern.as_deref(), Some("{uploader}/{title}"));
}

#[tokio::test]
async fn rule_block_cancels_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.apply_rule_command(RuleCommand::Block {
        item_id: id.clone(),
        reason: "File too large and queue is full".into(),
    })
    .await;

    let item = dl.get_item(&id).await.unwrap();
    assert_eq!(item.status, Status::Cancelled);
    assert_eq!(item.error_message, "File too large and queue is full");
}

#[tokio::test]
async fn rule_delay_parks_item_without_consuming_a_retry() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;
    let id = added(&dl, "https://host.example/v/abc", Priority::Normal).await;

    dl.apply_rule_command(RuleCommand::Delay {
        item_id: id.clone(),
        minutes: 10,
    })
    .await;

    let item = dl.get_item(&id).await.unwrap();
    assert_eq!(item.status, Status::Retrying);
    assert_eq!(item.retry_count, 0, "delay must not consume the retry budget");
    assert!(item.next_attempt_at.is_some());
    assert!(dl.next().await.is_none(), "delayed item is not admittable");
}

#[tokio::test]
async fn rule_notify_and_unknown_targets_are_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let dl = build_downloader(test_config(dir.path()), vec![stub()], false).await;

    dl.apply_rule_command(RuleCommand::Notify {
        message: "hello".into(),
        severity: NotifySeverity::Warning,
    })
    .await;
    dl.apply_rule_command(RuleCommand::SetQuality {
        item_id: ItemId::new("ghost"),
        quality: "best".into(),
    })
    .await;
}
