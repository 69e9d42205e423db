//! gallery-dl adapter — social media and image gallery scraping

use super::process::{self, ChildExit};
use super::{Engine, ProgressSink};
use crate::config::GalleryDlOptions;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ENGINE: EngineKind = EngineKind::GalleryDl;

fn url_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"instagram\.com",
            r"reddit\.com",
            r"twitter\.com|x\.com",
            r"pinterest\.com",
            r"tumblr\.com",
            r"pixiv\.net",
            r"deviantart\.com",
            r"artstation\.com",
        ]
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
    })
}

/// Gallery scraper backed by the gallery-dl CLI
///
/// gallery-dl prints one path per fetched file; the adapter counts them and
/// reports the tally as both progress and final file count.
pub struct GalleryDlEngine {
    options: GalleryDlOptions,
    available: bool,
}

impl GalleryDlEngine {
    /// Probe availability of the gallery-dl executable
    pub fn new(options: GalleryDlOptions) -> Self {
        let available = process::binary_available("gallery-dl");
        Self { options, available }
    }
}

#[async_trait::async_trait]
impl Engine for GalleryDlEngine {
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

        let mut cmd = process::engine_command("gallery-dl");
        cmd.arg("--dest").arg(&request.output_dir);
        if self.options.write_metadata {
            cmd.arg("--write-metadata").arg("--write-info-json");
        }
        if let Some(archive) = &self.options.archive_file {
            cmd.arg("--download-archive").arg(archive);
        }
        if let Some(bps) = request.bandwidth_bps {
            cmd.arg("--limit-rate").arg(bps.to_string());
        }
        cmd.arg(&request.url);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return FetchOutcome::error(ENGINE, format!("failed to launch gallery-dl: {e}"));
            }
        };

        let grace = Duration::from_secs(request.grace_seconds);
        let mut downloaded_files: Vec<PathBuf> = Vec::new();
        let mut last_error: Option<String> = None;
        let result = process::drive_child(child, &cancel, grace, |line| {
            if is_file_path_line(line) {
                downloaded_files.push(PathBuf::from(line.trim()));
                progress
                    .send(ProgressUpdate {
                        downloaded_bytes: None,
                        percent: None,
                        ..Default::default()
                    })
                    .ok();
            } else if line.contains("error") || (line.starts_with('[') && line.contains("Error")) {
                last_error = Some(line.to_string());
            }
        })
        .await;

        match result {
            Ok(ChildExit::Finished { success: true }) => FetchOutcome {
                file_count: Some(downloaded_files.len() as u64),
                output_path: downloaded_files.first().cloned(),
                ..FetchOutcome::success(ENGINE)
            },
            Ok(ChildExit::Finished { success: false }) => {
                let message =
                    last_error.unwrap_or_else(|| "gallery-dl exited with an error".into());
                if super::is_permanent_failure(&message) {
                    FetchOutcome::permanent_error(ENGINE, message)
                } else {
                    FetchOutcome::error(ENGINE, message)
                }
            }
            Ok(ChildExit::Cancelled) => FetchOutcome::error(ENGINE, "cancelled"),
            Err(e) => FetchOutcome::error(ENGINE, format!("gallery-dl I/O failure: {e}")),
        }
    }
}

/// gallery-dl prints absolute paths of fetched files on stdout
fn is_file_path_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('/')
        || (trimmed.len() > 2 && trimmed.as_bytes()[1] == b':' && trimmed.as_bytes()[0].is_ascii_alphabetic())
}
