use super::{MediaDownloader, SchedulerState};
use crate::config::{Config, PersistenceConfig, QueueConfig, RetryConfig};
use crate::engines::{Engine, EngineRegistry, ProgressSink};
use crate::events::{Event, EventBus};
use crate::retry::RetryPolicy;
use crate::rules::{RuleCommand, RulesEngine};
use crate::store::QueueStore;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Scripted engine adapter for scheduler tests
///
/// Runs without any external process: it emits the configured progress
/// updates, waits the configured delay (or blocks until cancelled), and
/// returns scripted outcomes in order, repeating success once the script is
/// exhausted.
pub(crate) struct StubEngine {
    kind: EngineKind,
    accepts: Option<&'static str>,
    delay: Duration,
    block_until_cancel: bool,
    progress_updates: Vec<ProgressUpdate>,
    playlist_entries: Vec<String>,
    outcomes: std::sync::Mutex<Vec<FetchOutcome>>,
    pub(crate) runs: AtomicU32,
    running: AtomicUsize,
    pub(crate) max_running: AtomicUsize,
}

impl StubEngine {
    pub(crate) fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            accepts: None,
            delay: Duration::from_millis(10),
            block_until_cancel: false,
            progress_updates: Vec::new(),
            playlist_entries: Vec::new(),
            outcomes: std::sync::Mutex::new(Vec::new()),
            runs: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Only claim URLs containing this substring
    pub(crate) fn accepting(mut self, pattern: &'static str) -> Self {
        self.accepts = Some(pattern);
        self
    }

    /// How long each run takes
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block until cancellation instead of finishing
    pub(crate) fn blocking(mut self) -> Self {
        self.block_until_cancel = true;
        self
    }

    /// Progress updates emitted at the start of each run
    pub(crate) fn with_progress(mut self, updates: Vec<ProgressUpdate>) -> Self {
        self.progress_updates = updates;
        self
    }

    /// Playlist children reported by expand_playlist
    pub(crate) fn with_playlist(mut self, entries: Vec<String>) -> Self {
        self.playlist_entries = entries;
        self
    }

    /// Scripted outcomes, consumed one per run
    pub(crate) fn with_outcomes(self, outcomes: Vec<FetchOutcome>) -> Self {
        *self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = outcomes;
        self
    }

    pub(crate) fn run_count(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn currently_running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> FetchOutcome {
        let mut outcomes = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if outcomes.is_empty() {
            FetchOutcome::success(self.kind)
        } else {
            outcomes.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl Engine for StubEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn available(&self) -> bool {
        true
    }

    fn handles(&self, url: &str) -> bool {
        self.accepts.is_none_or(|pattern| url.contains(pattern))
    }

    async fn expand_playlist(&self, _url: &str) -> crate::error::Result<Vec<String>> {
        Ok(self.playlist_entries.clone())
    }

    async fn run(
        &self,
        _request: FetchRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> FetchOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        for update in &self.progress_updates {
            progress.send(update.clone()).ok();
        }

        let outcome = if self.block_until_cancel {
            cancel.cancelled().await;
            FetchOutcome::error(self.kind, "cancelled")
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => self.next_outcome(),
                _ = cancel.cancelled() => FetchOutcome::error(self.kind, "cancelled"),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Test configuration rooted in a temp directory: in-memory store, fast
/// retries, no hard timeout surprises
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    Config {
        queue: QueueConfig {
            download_dir: dir.join("downloads"),
            max_concurrent_downloads: 1,
            grace_seconds_on_cancel: 1,
            ..Default::default()
        },
        retry: RetryConfig {
            base_seconds: 0.05,
            cap_seconds: 1.0,
            max_retries: 3,
        },
        persistence: PersistenceConfig {
            rules_file: dir.join("rules.json"),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build a downloader with stub engines, optionally without the queue
/// processor running (for tests that drive admission by hand)
pub(crate) async fn build_downloader(
    config: Config,
    engines: Vec<Arc<dyn Engine>>,
    start_processor: bool,
) -> MediaDownloader {
    build_downloader_with_store(
        config.clone(),
        engines,
        Arc::new(QueueStore::in_memory(config.persistence.terminal_ttl_days)),
        start_processor,
    )
    .await
}

/// Build a downloader on an explicit store (restart tests share one)
pub(crate) async fn build_downloader_with_store(
    config: Config,
    engines: Vec<Arc<dyn Engine>>,
    store: Arc<QueueStore>,
    start_processor: bool,
) -> MediaDownloader {
    tokio::fs::create_dir_all(&config.queue.download_dir)
        .await
        .expect("create download dir");

    let bus = EventBus::new(config.events.history_capacity);
    let (command_tx, command_rx) = mpsc::unbounded_channel::<RuleCommand>();
    let rules = Arc::new(RulesEngine::new(command_tx));
    bus.subscribe_handler(RulesEngine::subscription(), rules.clone());

    let retry_policy = RetryPolicy::new(&config.retry);
    let state = Arc::new(tokio::sync::Mutex::new(SchedulerState::new(
        config.queue.bandwidth_cap_bps,
    )));

    let downloader = MediaDownloader {
        store,
        bus,
        config: Arc::new(config),
        engines: Arc::new(EngineRegistry::with_engines(engines)),
        rules,
        retry_policy,
        state,
        queue_wakeup: Arc::new(tokio::sync::Notify::new()),
        shutdown_token: CancellationToken::new(),
    };

    downloader.restore_queue().await.expect("restore queue");
    let _ = downloader.start_rule_command_task(command_rx);
    if start_processor {
        let _ = downloader.start_queue_processor();
    }
    downloader
}

/// Collect every event published after this call into a shared vec
pub(crate) fn record_events(
    downloader: &MediaDownloader,
) -> Arc<tokio::sync::Mutex<Vec<Event>>> {
    let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut rx = downloader.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            sink.lock().await.push(event);
        }
    });
    events
}

/// Poll until `probe` returns true or the timeout elapses
pub(crate) async fn wait_until(timeout: Duration, mut probe: impl AsyncFnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
