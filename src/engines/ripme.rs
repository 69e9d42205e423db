//! ripme adapter — Java-based image gallery ripper

use super::process::{self, ChildExit};
use super::{Engine, ProgressSink};
use crate::config::RipmeOptions;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ENGINE: EngineKind = EngineKind::Ripme;

fn url_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"imgur\.com",
            r"8muses\.com",
            r"motherless\.com",
            r"xhamster\.com",
            r"imagefap\.com",
        ]
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
    })
}

/// Image ripper driving `java -jar ripme.jar`
///
/// Available only when both a `java` runtime and the configured jar file
/// are present.
pub struct RipmeEngine {
    options: RipmeOptions,
    available: bool,
}

impl RipmeEngine {
    /// Probe availability: java on PATH and the jar on disk
    pub fn new(options: RipmeOptions) -> Self {
        let available = process::binary_available("java") && options.jar_path.exists();
        Self { options, available }
    }
}

#[async_trait::async_trait]
impl Engine for RipmeEngine {
    fn kind(&self) -> EngineKind {
        ENGINE
    }

    fn available(&self) -> bool {
        self.available
    }

    fn handles(&self, url: &str) -> bool {
        url_patterns().iter().any(|re| re.is_match(url))
    }

    async fn run(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> FetchOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&request.output_dir).await {
            return FetchOutcome::error(ENGINE, format!("failed to create output directory: {e}"));
        }

        let mut cmd = process::engine_command("java");
        cmd.arg("-jar")
            .arg(&self.options.jar_path)
            .arg("--url")
            .arg(&request.url)
            .arg("--ripsdirectory")
            .arg(&request.output_dir)
            .arg("--no-prop-file");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return FetchOutcome::error(ENGINE, format!("failed to launch ripme: {e}"));
            }
        };

        let grace = Duration::from_secs(request.grace_seconds);
        let mut file_count: u64 = 0;
        let result = process::drive_child(child, &cancel, grace, |line| {
            if line.contains("Downloaded") {
                file_count += 1;
                progress.send(ProgressUpdate::default()).ok();
            } else if line.contains("Downloading") {
                progress.send(ProgressUpdate::default()).ok();
            }
        })
        .await;

        match result {
            Ok(ChildExit::Finished { success: true }) => FetchOutcome {
                file_count: Some(file_count),
                ..FetchOutcome::success(ENGINE)
            },
            Ok(ChildExit::Finished { success: false }) => {
                FetchOutcome::error(ENGINE, "ripme exited with an error")
            }
            Ok(ChildExit::Cancelled) => FetchOutcome::error(ENGINE, "cancelled"),
            Err(e) => FetchOutcome::error(ENGINE, format!("ripme I/O failure: {e}")),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_image_hosts() {
        let engine = RipmeEngine::new(RipmeOptions::default());
        assert!(engine.handles("https://imgur.com/gallery/abc"));
        assert!(engine.handles("https://www.imagefap.com/gallery/1"));
        assert!(!engine.handles("https://youtube.com/watch?v=abc"));
    }

    #[test]
    fn unavailable_without_jar_file() {
        let engine = RipmeEngine::new(RipmeOptions {
            jar_path: std::path::PathBuf::from("/nonexistent/ripme.jar"),
        });
        assert!(
            !engine.available(),
            "missing jar must mark the engine unavailable regardless of java"
        );
    }
}
