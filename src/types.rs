//! Core types for media-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use utoipa::ToSchema;

/// Unique identifier for a queue item
///
/// Derived from a collision-resistant hash of the URL and the creation
/// instant, so ids are stable across restarts once persisted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Create an ItemId from an existing string (e.g. a persisted record)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a fresh ItemId from a URL and a creation timestamp in nanoseconds
    pub fn derive(url: &str, creation_nanos: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(creation_nanos.to_be_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            use std::fmt::Write;
            // Writing to a String cannot fail
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(hex)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Queue item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting in the queue for admission
    Pending,
    /// Actively downloading via an engine
    Downloading,
    /// Failed, waiting for the retry clock to elapse
    Retrying,
    /// Paused by user
    Paused,
    /// Successfully completed
    Completed,
    /// Failed with no retries remaining
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl Status {
    /// Terminal statuses never transition except through an explicit user retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// Stable string tag used in persisted records and event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Downloading => "downloading",
            Status::Retrying => "retrying",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "downloading" => Ok(Status::Downloading),
            "retrying" => Ok(Status::Retrying),
            "paused" => Ok(Status::Paused),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status tag: {other}")),
        }
    }
}

/// Download priority
///
/// Items are admitted in priority order (highest first), FIFO within a
/// priority level.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (1)
    Low = 1,
    /// Normal priority (2)
    #[default]
    Normal = 2,
    /// High priority (3)
    High = 3,
    /// Urgent — ahead of everything else (4)
    Urgent = 4,
}

impl Priority {
    /// Convert integer priority code to Priority enum
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            4 => Priority::Urgent,
            _ => Priority::Normal, // Default to Normal for unknown priority
        }
    }
}

/// Backend fetch engine, referenced by a stable tag
///
/// The tags are opaque identifiers used in persisted records and events;
/// the registry maps them to adapter instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum EngineKind {
    /// General video extractor backed by aria2c segmented transfers
    #[serde(rename = "yt-dlp+aria2c")]
    YtDlpAria2,
    /// Live-stream recorder
    #[serde(rename = "streamlink")]
    Streamlink,
    /// Gallery and social media scraper
    #[serde(rename = "gallery-dl")]
    GalleryDl,
    /// Java-based image ripper
    #[serde(rename = "ripme")]
    Ripme,
}

impl EngineKind {
    /// Stable tag for this engine
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::YtDlpAria2 => "yt-dlp+aria2c",
            EngineKind::Streamlink => "streamlink",
            EngineKind::GalleryDl => "gallery-dl",
            EngineKind::Ripme => "ripme",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yt-dlp+aria2c" => Ok(EngineKind::YtDlpAria2),
            "streamlink" => Ok(EngineKind::Streamlink),
            "gallery-dl" => Ok(EngineKind::GalleryDl),
            "ripme" => Ok(EngineKind::Ripme),
            other => Err(format!("unknown engine tag: {other}")),
        }
    }
}

/// Per-item download options
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadOptions {
    /// Override the default output directory
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Format/quality selector passed through to the engine
    #[serde(default = "default_quality")]
    pub quality: String,

    /// Extract audio after download
    #[serde(default)]
    pub extract_audio: bool,

    /// Write subtitle files alongside the media
    #[serde(default)]
    pub write_subtitles: bool,

    /// Write the thumbnail alongside the media
    #[serde(default)]
    pub write_thumbnail: bool,

    /// Named settings profile applied by rules or callers
    #[serde(default)]
    pub profile: Option<String>,

    /// Output organization pattern (e.g. "{uploader}/{title}") applied by
    /// post-processing collaborators
    #[serde(default)]
    pub organize_pattern: Option<String>,

    /// Preferred engine (router still verifies availability and URL match)
    #[serde(default)]
    pub preferred_engine: Option<EngineKind>,

    /// Per-item bandwidth reservation in bytes per second
    #[serde(default)]
    pub bandwidth_bps: Option<u64>,
}

fn default_quality() -> String {
    "best".to_string()
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            quality: default_quality(),
            extract_audio: false,
            write_subtitles: false,
            write_thumbnail: false,
            profile: None,
            organize_pattern: None,
            preferred_engine: None,
            bandwidth_bps: None,
        }
    }
}

/// Live progress metadata on a queue item
///
/// Mutated only through the active worker's progress channel while the item
/// is in Downloading; reset to defaults on restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Progress {
    /// Downloaded bytes so far
    #[serde(default)]
    pub downloaded_bytes: u64,

    /// Total size in bytes (0 if unknown)
    #[serde(default)]
    pub total_bytes: u64,

    /// Progress percentage (0.0 to 100.0)
    #[serde(default)]
    pub percent: f32,

    /// Instantaneous speed as reported by the engine (e.g. "1.2MiB")
    #[serde(default)]
    pub speed: String,

    /// Estimated time remaining as reported by the engine (e.g. "30s")
    #[serde(default)]
    pub eta: String,

    /// Media title, once the engine has resolved it
    #[serde(default)]
    pub title: Option<String>,
}

/// A single normalized progress update emitted by an engine adapter
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Downloaded bytes
    pub downloaded_bytes: Option<u64>,
    /// Total bytes
    pub total_bytes: Option<u64>,
    /// Percentage (0.0 to 100.0)
    pub percent: Option<f32>,
    /// Speed text
    pub speed: Option<String>,
    /// ETA text
    pub eta: Option<String>,
    /// Media title
    pub title: Option<String>,
}

/// An item in the download queue
///
/// Created exclusively by the scheduler; status, timing, and retry counters
/// are mutated only by the scheduler. The active worker updates `progress`
/// through its scoped channel.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct QueueItem {
    /// Stable identifier
    pub id: ItemId,

    /// Source URL
    pub url: String,

    /// Admission priority
    pub priority: Priority,

    /// Current status
    pub status: Status,

    /// When the item was added to the queue
    pub created_at: DateTime<Utc>,

    /// When the item was first admitted (set exactly once)
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the item reached a terminal state (set exactly once)
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock instant at which a Retrying item becomes eligible again
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Number of retries consumed so far
    #[serde(default)]
    pub retry_count: u32,

    /// Retry cap for this item
    pub max_retries: u32,

    /// Last error text ("" if none)
    #[serde(default)]
    pub error_message: String,

    /// Engine selected for this item (set at admission by the router)
    #[serde(default)]
    pub engine: Option<EngineKind>,

    /// Per-item download options
    #[serde(default)]
    pub options: DownloadOptions,

    /// Bandwidth reserved while downloading, in bytes per second
    #[serde(default)]
    pub bandwidth_bps: Option<u64>,

    /// Playlist this item belongs to, if any
    #[serde(default)]
    pub playlist_id: Option<String>,

    /// Position within the playlist
    #[serde(default)]
    pub playlist_index: Option<u32>,

    /// True for a playlist placeholder that expands at admission
    #[serde(default)]
    pub playlist_placeholder: bool,

    /// Live progress metadata
    #[serde(default)]
    pub progress: Progress,
}

impl QueueItem {
    /// Create a new pending item
    pub fn new(
        url: impl Into<String>,
        priority: Priority,
        options: DownloadOptions,
        max_retries: u32,
    ) -> Self {
        let url = url.into();
        let created_at = Utc::now();
        let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
        let bandwidth_bps = options.bandwidth_bps;
        Self {
            id: ItemId::derive(&url, nanos),
            url,
            priority,
            status: Status::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            retry_count: 0,
            max_retries,
            error_message: String::new(),
            engine: None,
            options,
            bandwidth_bps,
            playlist_id: None,
            playlist_index: None,
            playlist_placeholder: false,
            progress: Progress::default(),
        }
    }

    /// Whether the item is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Result of calling [`add`](crate::MediaDownloader::add)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Item was created and queued
    Added(ItemId),
    /// URL matched an existing entry and skip_duplicates was set
    DuplicateSkipped,
}

impl AddOutcome {
    /// The new item id, if one was created
    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            AddOutcome::Added(id) => Some(id),
            AddOutcome::DuplicateSkipped => None,
        }
    }
}

/// A playlist aggregate tracked by the scheduler
///
/// Holds child ids only; children back-reference the playlist by id.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PlaylistState {
    /// Platform-local playlist id
    pub id: String,

    /// Platform that hosts the playlist
    pub platform: String,

    /// Ids of the child items
    pub child_ids: Vec<ItemId>,

    /// Children that reached Completed
    pub completed: usize,

    /// Children that reached Failed or Cancelled
    pub failed: usize,
}

impl PlaylistState {
    /// Total number of children
    pub fn total(&self) -> usize {
        self.child_ids.len()
    }

    /// Whether every child has reached a terminal state
    pub fn is_settled(&self) -> bool {
        !self.child_ids.is_empty() && self.completed + self.failed >= self.child_ids.len()
    }
}

/// Normalized result returned by an engine adapter
///
/// Adapter-local errors are converted into this form; the scheduler is the
/// sole authority that turns outcomes into state transitions and retries.
#[derive(Clone, Debug)]
pub struct FetchOutcome {
    /// Whether the fetch succeeded
    pub success: bool,

    /// True when the failure cannot be fixed by retrying (404, unsupported URL)
    pub permanent: bool,

    /// Engine that produced this outcome
    pub engine: EngineKind,

    /// Media title, if resolved
    pub title: Option<String>,

    /// Primary output path, if a single artifact was produced
    pub output_path: Option<PathBuf>,

    /// Number of files fetched (gallery engines)
    pub file_count: Option<u64>,

    /// Error text on failure
    pub message: Option<String>,
}

impl FetchOutcome {
    /// Successful outcome
    pub fn success(engine: EngineKind) -> Self {
        Self {
            success: true,
            permanent: false,
            engine,
            title: None,
            output_path: None,
            file_count: None,
            message: None,
        }
    }

    /// Transient failure — retry policy applies
    pub fn error(engine: EngineKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            permanent: false,
            engine,
            title: None,
            output_path: None,
            file_count: None,
            message: Some(message.into()),
        }
    }

    /// Permanent failure — goes straight to Failed
    pub fn permanent_error(engine: EngineKind, message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::error(engine, message)
        }
    }
}

/// Request handed to an engine adapter for one fetch
#[derive(Clone, Debug)]
pub struct FetchRequest {
    /// Item being fetched (used for temp-file naming and logging)
    pub item_id: ItemId,

    /// Source URL
    pub url: String,

    /// Output directory (created by the adapter before launch)
    pub output_dir: PathBuf,

    /// Format/quality selector
    pub quality: String,

    /// Bandwidth budget in bytes per second, if reserved
    pub bandwidth_bps: Option<u64>,

    /// Extract audio after download
    pub extract_audio: bool,

    /// Write subtitle files
    pub write_subtitles: bool,

    /// Write the thumbnail
    pub write_thumbnail: bool,

    /// Grace period in seconds before a cancelled child is force-killed
    pub grace_seconds: u64,
}

/// Bandwidth ledger snapshot
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct BandwidthSnapshot {
    /// Sum of active reservations in bytes per second
    pub allocated_bps: u64,

    /// Global cap (None = unlimited)
    pub cap_bps: Option<u64>,

    /// Number of active reservations
    pub active_reservations: usize,
}

/// Lifetime statistics counters
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct QueueCounters {
    /// Items admitted into the queue
    pub total_added: u64,

    /// Items that completed successfully
    pub total_completed: u64,

    /// Items that reached Failed
    pub total_failed: u64,

    /// Adds skipped by duplicate suppression
    pub duplicates_skipped: u64,
}

/// Point-in-time queue status snapshot
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct QueueSnapshot {
    /// Total tracked items (including terminal, until purged)
    pub total_items: usize,

    /// Items currently downloading
    pub active_downloads: usize,

    /// Entries waiting in the priority queue
    pub queue_depth: usize,

    /// Item counts per status tag
    pub status_counts: BTreeMap<String, usize>,

    /// Bandwidth ledger state
    pub bandwidth: BandwidthSnapshot,

    /// Lifetime statistics
    pub statistics: QueueCounters,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // --- ItemId derivation ---

    #[test]
    fn item_id_derive_is_stable_for_same_inputs() {
        let a = ItemId::derive("https://example.com/v/1", 12345);
        let b = ItemId::derive("https://example.com/v/1", 12345);
        assert_eq!(a, b, "same url and nanos must derive the same id");
    }

    #[test]
    fn item_id_derive_differs_for_different_creation_instants() {
        let a = ItemId::derive("https://example.com/v/1", 12345);
        let b = ItemId::derive("https://example.com/v/1", 12346);
        assert_ne!(a, b, "different creation nanos must derive different ids");
    }

    #[test]
    fn item_id_is_sixteen_hex_chars() {
        let id = ItemId::derive("https://example.com/v/1", 99);
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    // --- Status ---

    #[test]
    fn terminal_statuses_are_exactly_completed_failed_cancelled() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Downloading.is_terminal());
        assert!(!Status::Retrying.is_terminal());
        assert!(!Status::Paused.is_terminal());
    }

    #[test]
    fn status_serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&Status::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        let back: Status = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, Status::Cancelled);
    }

    // --- Priority ---

    #[test]
    fn priority_ordering_urgent_highest() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_from_unknown_integer_defaults_to_normal() {
        assert_eq!(Priority::from_i32(0), Priority::Normal);
        assert_eq!(Priority::from_i32(99), Priority::Normal);
    }

    // --- EngineKind tags ---

    #[test]
    fn engine_kind_round_trips_through_stable_tags() {
        for kind in [
            EngineKind::YtDlpAria2,
            EngineKind::Streamlink,
            EngineKind::GalleryDl,
            EngineKind::Ripme,
        ] {
            let tag = kind.as_str();
            assert_eq!(EngineKind::from_str(tag).unwrap(), kind);
            // serde uses the same tags as Display
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{tag}\""));
        }
    }

    #[test]
    fn engine_kind_rejects_unknown_tag() {
        assert!(EngineKind::from_str("wget").is_err());
    }

    // --- QueueItem serialization round trip ---

    #[test]
    fn queue_item_survives_serde_round_trip() {
        let mut item = QueueItem::new(
            "https://example.com/v/abc",
            Priority::High,
            DownloadOptions {
                quality: "best[height<=1080]".into(),
                extract_audio: true,
                ..Default::default()
            },
            3,
        );
        item.status = Status::Retrying;
        item.retry_count = 2;
        item.error_message = "timeout".into();
        item.engine = Some(EngineKind::YtDlpAria2);
        item.next_attempt_at = Some(Utc::now());
        item.playlist_id = Some("PL123".into());
        item.playlist_index = Some(4);
        item.progress.title = Some("Abc".into());
        item.progress.downloaded_bytes = 1024;

        let json = serde_json::to_string(&item).unwrap();
        let back: QueueItem = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, item.id);
        assert_eq!(back.url, item.url);
        assert_eq!(back.priority, item.priority);
        assert_eq!(back.status, item.status);
        assert_eq!(back.created_at, item.created_at);
        assert_eq!(back.retry_count, item.retry_count);
        assert_eq!(back.max_retries, item.max_retries);
        assert_eq!(back.error_message, item.error_message);
        assert_eq!(back.engine, item.engine);
        assert_eq!(back.next_attempt_at, item.next_attempt_at);
        assert_eq!(back.playlist_id, item.playlist_id);
        assert_eq!(back.playlist_index, item.playlist_index);
        assert_eq!(back.options.quality, item.options.quality);
        assert!(back.options.extract_audio);
        assert_eq!(back.progress.title, item.progress.title);
        assert_eq!(back.progress.downloaded_bytes, 1024);
    }

    #[test]
    fn new_item_starts_pending_with_no_timestamps() {
        let item = QueueItem::new(
            "https://example.com/a",
            Priority::Normal,
            DownloadOptions::default(),
            3,
        );
        assert_eq!(item.status, Status::Pending);
        assert!(item.started_at.is_none());
        assert!(item.completed_at.is_none());
        assert!(item.next_attempt_at.is_none());
        assert_eq!(item.retry_count, 0);
        assert!(!item.is_terminal());
    }

    // --- AddOutcome ---

    #[test]
    fn add_outcome_exposes_item_id_only_when_added() {
        let id = ItemId::new("abc123");
        assert_eq!(AddOutcome::Added(id.clone()).item_id(), Some(&id));
        assert_eq!(AddOutcome::DuplicateSkipped.item_id(), None);
    }

    // --- PlaylistState ---

    #[test]
    fn playlist_settles_only_when_all_children_terminal() {
        let mut pl = PlaylistState {
            id: "PL1".into(),
            platform: "youtube".into(),
            child_ids: vec![ItemId::new("a"), ItemId::new("b")],
            completed: 1,
            failed: 0,
        };
        assert!(!pl.is_settled());
        pl.failed = 1;
        assert!(pl.is_settled());
    }

    #[test]
    fn empty_playlist_is_never_settled() {
        let pl = PlaylistState {
            id: "PL1".into(),
            platform: "youtube".into(),
            child_ids: vec![],
            completed: 0,
            failed: 0,
        };
        assert!(!pl.is_settled());
    }
}
