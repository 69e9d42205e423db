//! # media-dl
//!
//! Multi-engine media download orchestrator library.
//!
//! media-dl accepts URLs, routes each to the best-suited external fetcher
//! (yt-dlp+aria2c for general video, streamlink for live streams, gallery-dl
//! for galleries and social media, ripme for image hosts), and manages a
//! prioritized work queue with bandwidth budgeting, retry with exponential
//! backoff, pause/resume, duplicate suppression, and playlist expansion.
//! Lifecycle changes flow through a typed event bus to in-process
//! subscribers (the rules engine) and to external consumers over SSE and
//! WebSocket.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - No CLI or UI; embed the [`MediaDownloader`] handle
//!   and optionally spawn the bundled REST API server
//! - **Single scheduler actor** - All queue mutations serialize through one
//!   lock, making the state-machine invariants easy to uphold
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **External engines** - Fetching is delegated to battle-tested tools;
//!   this crate owns orchestration, not extraction
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_dl::{Config, MediaDownloader, Priority, DownloadOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = MediaDownloader::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {} from {}", event.event_type, event.source);
//!         }
//!     });
//!
//!     downloader
//!         .add(
//!             "https://www.youtube.com/watch?v=abc",
//!             Priority::Normal,
//!             DownloadOptions::default(),
//!             true,
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Bandwidth reservation ledger
pub mod bandwidth;
/// Configuration types
pub mod config;
/// Duplicate detection
pub mod dedup;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Engine registry, router, and adapters
pub mod engines;
/// Error types
pub mod error;
/// Event bus
pub mod events;
/// Playlist URL classification
pub mod playlist;
/// Retry policy with exponential backoff
pub mod retry;
/// Rules engine
pub mod rules;
/// Queue persistence adapter
pub mod store;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use downloader::MediaDownloader;
pub use error::{ApiError, Error, ErrorDetail, QueueError, Result, StoreError, ToHttpStatus};
pub use events::{Event, EventBus, EventType, Subscription};
pub use rules::{Rule, RuleAction, RuleCondition, RulesEngine};
pub use store::QueueStore;
pub use types::{
    AddOutcome, DownloadOptions, EngineKind, ItemId, Priority, Progress, QueueItem, QueueSnapshot,
    Status,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_dl::{Config, MediaDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = MediaDownloader::new(Config::default()).await?;
///     run_with_shutdown(downloader).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: MediaDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests); fall back progressively
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
