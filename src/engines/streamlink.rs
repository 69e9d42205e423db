//! streamlink adapter — live-stream recording

use super::process::{self, ChildExit};
use super::{Engine, ProgressSink};
use crate::config::StreamlinkOptions;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use crate::utils::parse_size;
use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ENGINE: EngineKind = EngineKind::Streamlink;

fn url_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"twitch\.tv",
            r"youtube\.com/watch.*[?&]v=.*live",
            r"kick\.com",
            r"afreecatv\.com",
            r"douyu\.com",
            r"huya\.com",
        ]
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
    })
}

/// `[download] Written 12.34 MiB (1m23s @ 1.2 MiB/s)` and older
/// `Written N bytes` shapes
fn written_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"Written\s+([0-9.]+)\s*([KMGT]?i?B)").unwrap();
        re
    })
}

/// Live-stream recorder backed by the streamlink CLI
pub struct StreamlinkEngine {
    options: StreamlinkOptions,
    available: bool,
}

impl StreamlinkEngine {
    /// Probe availability of the streamlink executable
    pub fn new(options: StreamlinkOptions) -> Self {
        let available = process::binary_available("streamlink");
        Self { options, available }
    }
}

#[async_trait::async_trait]
impl Engine for StreamlinkEngine {
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

        let output_path = request
            .output_dir
            .join(format!("stream_{}.ts", Utc::now().timestamp()));

        let mut cmd = process::engine_command("streamlink");
        cmd.arg(&request.url)
            .arg(&request.quality)
            .arg("--output")
            .arg(&output_path)
            .arg("--hls-live-restart")
            .arg("--retry-streams")
            .arg(self.options.retry_streams.to_string())
            .arg("--retry-max")
            .arg(self.options.retry_max.to_string())
            .arg("--force-progress");
        if let Some(duration) = self.options.duration_seconds {
            cmd.arg("--hls-duration").arg(duration.to_string());
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return FetchOutcome::error(ENGINE, format!("failed to launch streamlink: {e}"));
            }
        };

        let grace = Duration::from_secs(request.grace_seconds);
        let mut last_error: Option<String> = None;
        let result = process::drive_child(child, &cancel, grace, |line| {
            if let Some(update) = parse_streamlink_progress(line) {
                progress.send(update).ok();
            } else if line.contains("error:") {
                last_error = Some(line.to_string());
            }
        })
        .await;

        match result {
            Ok(ChildExit::Finished { success: true }) => FetchOutcome {
                output_path: Some(output_path),
                ..FetchOutcome::success(ENGINE)
            },
            Ok(ChildExit::Finished { success: false }) => {
                let message =
                    last_error.unwrap_or_else(|| "streamlink exited with an error".into());
                if message.contains("No playable streams found") {
                    FetchOutcome::permanent_error(ENGINE, message)
                } else {
                    FetchOutcome::error(ENGINE, message)
                }
            }
            Ok(ChildExit::Cancelled) => FetchOutcome::error(ENGINE, "cancelled"),
            Err(e) => FetchOutcome::error(ENGINE, format!("streamlink I/O failure: {e}")),
        }
    }
}

/// Parse a streamlink "Written …" line into a progress update
///
/// Live streams have no known total, so only downloaded bytes are reported.
fn parse_streamlink_progress(line: &str) -> Option<ProgressUpdate> {
    let caps = written_re().captures(line)?;
    let downloaded = parse_size(&format!("{}{}", &caps[1], &caps[2]))?;
    Some(ProgressUpdate {
        downloaded_bytes: Some(downloaded),
        ..Default::default()
    })
}
