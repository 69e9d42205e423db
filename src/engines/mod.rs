//! Engine registry, router, and adapters
//!
//! Each adapter speaks to one external fetch tool and exposes availability
//! (probed once at construction), a URL matcher, and a `run` method that
//! drives the external process and normalizes its output. The router picks
//! an adapter per URL with specialized tools tried before the general video
//! extractor.

use crate::config::EnginesConfig;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

mod gallerydl;
mod process;
mod ripme;
mod streamlink;
mod ytdlp;

pub use gallerydl::GalleryDlEngine;
pub use ripme::RipmeEngine;
pub use streamlink::StreamlinkEngine;
pub use ytdlp::YtDlpAria2Engine;

/// Channel on which an adapter reports normalized progress updates
pub type ProgressSink = tokio::sync::mpsc::UnboundedSender<ProgressUpdate>;

/// A backend fetch engine adapter
///
/// `run` never returns an error: adapter-local failures are normalized into
/// the [`FetchOutcome`]. An adapter spawns at most one child process per
/// queue item; parallelism across items belongs to the scheduler.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Stable engine tag
    fn kind(&self) -> EngineKind;

    /// Whether the backing executable(s) were found at startup
    fn available(&self) -> bool;

    /// Whether this engine claims the URL
    fn handles(&self, url: &str) -> bool;

    /// Expand a playlist URL into child URLs
    ///
    /// The default implementation reports no children; only engines that
    /// understand playlists override it.
    async fn expand_playlist(&self, url: &str) -> crate::error::Result<Vec<String>> {
        let _ = url;
        Ok(Vec::new())
    }

    /// Fetch the URL, streaming progress and honoring cancellation
    ///
    /// Must create the output directory before launch, keep the child's
    /// stdout and stderr drained, terminate the child within the configured
    /// grace on cancellation, and clean up any temp files on every exit path.
    async fn run(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> FetchOutcome;
}

/// Availability report for one engine
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct EngineStatus {
    /// Engine tag
    pub engine: EngineKind,
    /// Whether the backing executable(s) were found
    pub available: bool,
}

/// Registry of engine adapters with URL routing
///
/// Holds adapters in fixed preference order: specialized tools first
/// (live-stream recorder, gallery scraper, image ripper), then the general
/// video extractor as fallback.
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineRegistry {
    /// Build the registry, probing each adapter's availability
    pub fn new(config: &EnginesConfig) -> Self {
        let engines: Vec<Arc<dyn Engine>> = vec![
            Arc::new(StreamlinkEngine::new(config.streamlink.clone())),
            Arc::new(GalleryDlEngine::new(config.gallery_dl.clone())),
            Arc::new(RipmeEngine::new(config.ripme.clone())),
            Arc::new(YtDlpAria2Engine::new(config.aria2.clone())),
        ];

        let available: Vec<&str> = engines
            .iter()
            .filter(|e| e.available())
            .map(|e| e.kind().as_str())
            .collect();
        tracing::info!(available = ?available, "Engine availability probed");

        Self { engines }
    }

    /// Build a registry from explicit adapters (tests, embedders)
    pub fn with_engines(engines: Vec<Arc<dyn Engine>>) -> Self {
        Self { engines }
    }

    /// Select the best engine for a URL
    ///
    /// A preferred engine wins when it is available and claims the URL;
    /// otherwise the preference order decides. Returns None when no
    /// available adapter accepts the URL.
    pub fn select(&self, url: &str, preferred: Option<EngineKind>) -> Option<Arc<dyn Engine>> {
        if let Some(kind) = preferred
            && let Some(engine) = self.get(kind)
            && engine.available()
            && engine.handles(url)
        {
            return Some(engine);
        }

        self.engines
            .iter()
            .find(|e| e.available() && e.handles(url))
            .cloned()
    }

    /// Look up an adapter by tag
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn Engine>> {
        self.engines.iter().find(|e| e.kind() == kind).cloned()
    }

    /// Availability of every registered engine, in preference order
    pub fn availability(&self) -> Vec<EngineStatus> {
        self.engines
            .iter()
            .map(|e| EngineStatus {
                engine: e.kind(),
                available: e.available(),
            })
            .collect()
    }
}

/// Classify an engine error message as permanent (not worth retrying)
pub(crate) fn is_permanent_failure(message: &str) -> bool {
    let lowered = message.to_lowercase();
    [
        "unsupported url",
        "is not a valid url",
        "404",
        "not found",
        "private video",
        "video unavailable",
        "does not exist",
        "no video formats",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal scripted engine for router tests
    struct FakeEngine {
        kind: EngineKind,
        available: bool,
        pattern: &'static str,
    }

    #[async_trait::async_trait]
    impl Engine for FakeEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn available(&self) -> bool {
            self.available
        }

        fn handles(&self, url: &str) -> bool {
            url.contains(self.pattern)
        }

        async fn run(
            &self,
            _request: FetchRequest,
            _progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> FetchOutcome {
            FetchOutcome::success(self.kind)
        }
    }

    fn registry(entries: &[(EngineKind, bool, &'static str)]) -> EngineRegistry {
        EngineRegistry::with_engines(
            entries
                .iter()
                .map(|&(kind, available, pattern)| {
                    Arc::new(FakeEngine {
                        kind,
                        available,
                        pattern,
                    }) as Arc<dyn Engine>
                })
                .collect(),
        )
    }

    #[test]
    fn preference_order_picks_first_matching_available() {
        let registry = registry(&[
            (EngineKind::Streamlink, true, "twitch.tv"),
            (EngineKind::GalleryDl, true, "instagram.com"),
            (EngineKind::YtDlpAria2, true, "twitch.tv"),
        ]);

        // Both streamlink and yt-dlp claim twitch; specialized wins
        let selected = registry.select("https://twitch.tv/somestream", None).unwrap();
        assert_eq!(selected.kind(), EngineKind::Streamlink);
    }

    #[test]
    fn unavailable_engine_is_skipped() {
        let registry = registry(&[
            (EngineKind::Streamlink, false, "twitch.tv"),
            (EngineKind::YtDlpAria2, true, "twitch.tv"),
        ]);

        let selected = registry.select("https://twitch.tv/somestream", None).unwrap();
        assert_eq!(selected.kind(), EngineKind::YtDlpAria2);
    }

    #[test]
    fn preferred_engine_wins_when_it_claims_the_url() {
        let registry = registry(&[
            (EngineKind::Streamlink, true, "example.com"),
            (EngineKind::YtDlpAria2, true, "example.com"),
        ]);

        let selected = registry
            .select("https://example.com/v", Some(EngineKind::YtDlpAria2))
            .unwrap();
        assert_eq!(selected.kind(), EngineKind::YtDlpAria2);
    }

    #[test]
    fn preferred_engine_falls_back_when_it_does_not_claim_url() {
        let registry = registry(&[
            (EngineKind::GalleryDl, true, "instagram.com"),
            (EngineKind::YtDlpAria2, true, "youtube.com"),
        ]);

        let selected = registry
            .select("https://instagram.com/p/x", Some(EngineKind::YtDlpAria2))
            .unwrap();
        assert_eq!(
            selected.kind(),
            EngineKind::GalleryDl,
            "preferred engine not claiming the URL falls back to routing"
        );
    }

    #[test]
    fn no_engine_accepts_returns_none() {
        let registry = registry(&[(EngineKind::YtDlpAria2, true, "youtube.com")]);
        assert!(registry.select("https://unknown.example/x", None).is_none());
    }

    #[test]
    fn availability_reports_all_engines_in_order() {
        let registry = registry(&[
            (EngineKind::Streamlink, false, "a"),
            (EngineKind::YtDlpAria2, true, "b"),
        ]);
        let statuses = registry.availability();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].engine, EngineKind::Streamlink);
        assert!(!statuses[0].available);
        assert!(statuses[1].available);
    }

    #[test]
    fn permanent_failure_classification() {
        assert!(is_permanent_failure("ERROR: Unsupported URL: https://x"));
        assert!(is_permanent_failure("HTTP Error 404: Not Found"));
        assert!(is_permanent_failure("Private video. Sign in"));
        assert!(!is_permanent_failure("Connection timed out"));
        assert!(!is_permanent_failure("temporary failure in name resolution"));
    }
}
