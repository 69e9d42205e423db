//! yt-dlp + aria2c adapter — general video extraction with segmented transfer
//!
//! The fast path extracts the direct media URL with `yt-dlp --dump-json`
//! and hands the transfer to aria2c for segmented download. When the fetch
//! needs yt-dlp's own post-extraction features (audio extraction, subtitles,
//! thumbnails) or no single direct URL exists, the adapter falls back to
//! driving yt-dlp directly.

use super::process::{self, ChildExit};
use super::{Engine, ProgressSink, is_permanent_failure};
use crate::config::Aria2Options;
use crate::types::{EngineKind, FetchOutcome, FetchRequest, ProgressUpdate};
use crate::utils::{parse_size, sanitize_filename};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ENGINE: EngineKind = EngineKind::YtDlpAria2;

fn url_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"youtube\.com|youtu\.be",
            r"vimeo\.com",
            r"dailymotion\.com",
            r"twitch\.tv",
            r"facebook\.com",
            r"tiktok\.com",
            r"twitter\.com|x\.com",
        ]
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
    })
}

/// aria2c summary line: `[#1 SIZE:12.3MiB/45.6MiB(27%) CN:8 DL:1.2MiB ETA:30s]`
fn aria2_progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(
            r"SIZE:([0-9.]+[KMGT]?iB)/([0-9.]+[KMGT]?iB)\((\d+)%\).*DL:([0-9.]+[KMGT]?iB).*ETA:(\w+)",
        )
        .unwrap();
        re
    })
}

/// yt-dlp `--newline` progress: `[download]  27.0% of 45.60MiB at 1.20MiB/s ETA 00:30`
fn ytdlp_progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(
            r"\[download\]\s+([0-9.]+)% of ~?\s*([0-9.]+[KMGT]?iB)(?: at\s+([0-9.]+[KMGT]?iB)/s)?(?: ETA (\S+))?",
        )
        .unwrap();
        re
    })
}

/// General video extractor driving yt-dlp, with aria2c as transfer backend
pub struct YtDlpAria2Engine {
    options: Aria2Options,
    available: bool,
}

impl YtDlpAria2Engine {
    /// Probe availability (both yt-dlp and aria2c must be present)
    pub fn new(options: Aria2Options) -> Self {
        let available =
            process::binary_available("yt-dlp") && process::binary_available("aria2c");
        Self { options, available }
    }

    /// Extract media metadata without downloading
    async fn extract_info(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, FetchOutcome> {
        let mut cmd = process::engine_command("yt-dlp");
        cmd.arg("--dump-json")
            .arg("--no-download")
            .arg("--no-playlist")
            .arg(format!("--format={}", request.quality))
            .arg(&request.url);

        let output = tokio::select! {
            result = cmd.output() => match result {
                Ok(output) => output,
                Err(e) => {
                    return Err(FetchOutcome::error(ENGINE, format!("failed to launch yt-dlp: {e}")));
                }
            },
            _ = cancel.cancelled() => {
                return Err(FetchOutcome::error(ENGINE, "cancelled during extraction"));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("yt-dlp extraction failed")
                .to_string();
            return Err(if is_permanent_failure(&message) {
                FetchOutcome::permanent_error(ENGINE, message)
            } else {
                FetchOutcome::error(ENGINE, message)
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            FetchOutcome::error(ENGINE, format!("unparseable yt-dlp metadata: {e}"))
        })
    }

    /// Transfer a direct URL with aria2c
    async fn download_with_aria2(
        &self,
        request: &FetchRequest,
        direct_url: &str,
        output_path: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        // aria2c reads URL and per-download options from an input file; the
        // file must be removed on every exit path.
        let input_path =
            std::env::temp_dir().join(format!("media-dl-aria2-{}.txt", request.item_id));

        let mut input = format!("{direct_url}\n");
        if let Some(name) = output_path.file_name() {
            input.push_str(&format!("  out={}\n", name.to_string_lossy()));
        }
        input.push_str(&format!("  dir={}\n", request.output_dir.display()));
        input.push_str(&format!(
            "  max-connection-per-server={}\n",
            self.options.max_connection_per_server
        ));
        input.push_str(&format!("  split={}\n", self.options.split));
        input.push_str(&format!("  min-split-size={}\n", self.options.min_split_size));
        input.push_str("  continue=true\n");
        input.push_str(&format!("  max-tries={}\n", self.options.max_tries));
        input.push_str(&format!("  retry-wait={}\n", self.options.retry_wait));
        if let Some(bps) = request.bandwidth_bps {
            input.push_str(&format!("  max-overall-download-limit={bps}\n"));
        }

        if let Err(e) = tokio::fs::write(&input_path, &input).await {
            return FetchOutcome::error(ENGINE, format!("failed to write aria2c input file: {e}"));
        }

        let mut cmd = process::engine_command("aria2c");
        cmd.arg("--input-file")
            .arg(&input_path)
            .arg("--summary-interval")
            .arg("1");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tokio::fs::remove_file(&input_path).await.ok();
                return FetchOutcome::error(ENGINE, format!("failed to launch aria2c: {e}"));
            }
        };

        let grace = Duration::from_secs(request.grace_seconds);
        let result = process::drive_child(child, cancel, grace, |line| {
            if let Some(update) = parse_aria2_progress(line) {
                progress.send(update).ok();
            }
        })
        .await;

        tokio::fs::remove_file(&input_path).await.ok();

        match result {
            Ok(ChildExit::Finished { success: true }) => FetchOutcome::success(ENGINE),
            Ok(ChildExit::Finished { success: false }) => {
                FetchOutcome::error(ENGINE, "aria2c exited with an error")
            }
            Ok(ChildExit::Cancelled) => FetchOutcome::error(ENGINE, "cancelled"),
            Err(e) => FetchOutcome::error(ENGINE, format!("aria2c I/O failure: {e}")),
        }
    }

    /// Drive yt-dlp end to end (audio extraction, subtitles, thumbnails, or
    /// media without a single direct URL)
    async fn download_direct(
        &self,
        request: &FetchRequest,
        title_hint: Option<String>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let mut cmd = process::engine_command("yt-dlp");
        cmd.arg("--newline")
            .arg("--no-playlist")
            .arg(format!("--format={}", request.quality))
            .arg("--paths")
            .arg(&request.output_dir)
            .arg("--output")
            .arg("%(title)s.%(ext)s");

        if request.extract_audio {
            cmd.arg("--extract-audio").arg("--audio-format").arg("mp3");
        }
        if request.write_subtitles {
            cmd.arg("--write-subs");
        }
        if request.write_thumbnail {
            cmd.arg("--write-thumbnail");
        }
        if let Some(bps) = request.bandwidth_bps {
            cmd.arg("--limit-rate").arg(bps.to_string());
        }
        cmd.arg(&request.url);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return FetchOutcome::error(ENGINE, format!("failed to launch yt-dlp: {e}"));
            }
        };

        let grace = Duration::from_secs(request.grace_seconds);
        let mut destination: Option<PathBuf> = None;
        let mut last_error: Option<String> = None;
        let result = process::drive_child(child, cancel, grace, |line| {
            if let Some(update) = parse_ytdlp_progress(line) {
                progress.send(update).ok();
            } else if let Some(rest) = line.strip_prefix("[download] Destination: ") {
                destination = Some(PathBuf::from(rest.trim()));
            } else if line.starts_with("ERROR:") {
                last_error = Some(line.to_string());
            }
        })
        .await;

        match result {
            Ok(ChildExit::Finished { success: true }) => FetchOutcome {
                title: title_hint,
                output_path: destination,
                ..FetchOutcome::success(ENGINE)
            },
            Ok(ChildExit::Finished { success: false }) => {
                let message = last_error.unwrap_or_else(|| "yt-dlp exited with an error".into());
                if is_permanent_failure(&message) {
                    FetchOutcome::permanent_error(ENGINE, message)
                } else {
                    FetchOutcome::error(ENGINE, message)
                }
            }
            Ok(ChildExit::Cancelled) => FetchOutcome::error(ENGINE, "cancelled"),
            Err(e) => FetchOutcome::error(ENGINE, format!("yt-dlp I/O failure: {e}")),
        }
    }
}

#[async_trait::async_trait]
impl Engine for YtDlpAria2Engine {
    fn kind(&self) -> EngineKind {
        ENGINE
    }

    fn available(&self) -> bool {
        self.available
    }

    fn handles(&self, url: &str) -> bool {
        url_patterns().iter().any(|re| re.is_match(url))
    }

    async fn expand_playlist(&self, url: &str) -> crate::error::Result<Vec<String>> {
        let mut cmd = process::engine_command("yt-dlp");
        cmd.arg("--flat-playlist").arg("--dump-json").arg(url);

        let output = cmd
            .output()
            .await
            .map_err(|e| crate::error::Error::Other(format!("failed to launch yt-dlp: {e}")))?;

        if !output.status.success() {
            return Err(crate::error::Error::Other(format!(
                "playlist expansion failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let mut urls = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if let Some(u) = entry.get("url").and_then(|v| v.as_str()) {
                urls.push(u.to_string());
            } else if let Some(id) = entry.get("id").and_then(|v| v.as_str()) {
                urls.push(format!("https://www.youtube.com/watch?v={id}"));
            }
        }
        Ok(urls)
    }

    async fn run(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> FetchOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&request.output_dir).await {
            return FetchOutcome::error(
                ENGINE,
                format!("failed to create output directory: {e}"),
            );
        }

        // Post-extraction features need yt-dlp to own the transfer
        if request.extract_audio || request.write_subtitles || request.write_thumbnail {
            return self.download_direct(&request, None, &progress, &cancel).await;
        }

        let info = match self.extract_info(&request, &cancel).await {
            Ok(info) => info,
            Err(outcome) => return outcome,
        };

        let title = info
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(t) = &title {
            progress
                .send(ProgressUpdate {
                    title: Some(t.clone()),
                    ..Default::default()
                })
                .ok();
        }

        let Some(direct_url) = info.get("url").and_then(|v| v.as_str()) else {
            // Multi-format media (separate audio/video); let yt-dlp merge it
            return self.download_direct(&request, title, &progress, &cancel).await;
        };

        let filename = sanitize_filename(title.as_deref().unwrap_or("video"));
        let ext = info.get("ext").and_then(|v| v.as_str()).unwrap_or("mp4");
        let output_path = request.output_dir.join(format!("{filename}.{ext}"));

        let mut outcome = self
            .download_with_aria2(&request, direct_url, &output_path, &progress, &cancel)
            .await;
        if outcome.success {
            outcome.title = title;
            outcome.output_path = Some(output_path);
        }
        outcome
    }
}

/// Parse an aria2c summary line into a progress update
fn parse_aria2_progress(line: &str) -> Option<ProgressUpdate> {
    let caps = aria2_progress_re().captures(line)?;
    Some(ProgressUpdate {
        downloaded_bytes: parse_size(&caps[1]),
        total_bytes: parse_size(&caps[2]),
        percent: caps[3].parse().ok(),
        speed: Some(caps[4].to_string()),
        eta: Some(caps[5].to_string()),
        title: None,
    })
}

/// Parse a yt-dlp `--newline` progress line into a progress update
fn parse_ytdlp_progress(line: &str) -> Option<ProgressUpdate> {
    let caps = ytdlp_progress_re().captures(line)?;
    let percent: Option<f32> = caps[1].parse().ok();
    let total = parse_size(&caps[2]);
    let downloaded = match (percent, total) {
        (Some(p), Some(t)) => Some(((p as f64 / 100.0) * t as f64) as u64),
        _ => None,
    };
    Some(ProgressUpdate {
        downloaded_bytes: downloaded,
        total_bytes: total,
        percent,
        speed: caps.get(3).map(|m| m.as_str().to_string()),
        eta: caps.get(4).map(|m| m.as_str().to_string()),
        title: None,
    })
}
