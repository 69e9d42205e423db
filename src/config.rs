//! Configuration types for media-dl

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use utoipa::ToSchema;

use crate::error::{Error, Result};

/// Queue behavior configuration (concurrency, bandwidth, timeouts)
///
/// Groups settings for how the scheduler admits and gates items.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct QueueConfig {
    /// Download directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent downloads (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Global bandwidth cap in bytes per second (None = unlimited)
    #[serde(default)]
    pub bandwidth_cap_bps: Option<u64>,

    /// Default per-item bandwidth reservation when an item specifies none
    /// (default: 1 MiB/s)
    #[serde(default = "default_item_bandwidth")]
    pub default_item_bandwidth_bps: u64,

    /// Grace period before force-killing a cancelled engine child (default: 5s)
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds_on_cancel: u64,

    /// Hard per-item ceiling after which the scheduler fails the download
    /// (default: 3600s, 0 = disabled)
    #[serde(default = "default_hard_timeout")]
    pub hard_item_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            bandwidth_cap_bps: None,
            default_item_bandwidth_bps: default_item_bandwidth(),
            grace_seconds_on_cancel: default_grace_seconds(),
            hard_item_timeout_seconds: default_hard_timeout(),
        }
    }
}

/// Retry configuration for failed downloads
///
/// The scheduler consults the retry policy on every failure; the delay before
/// attempt `n` is `min(base_seconds * 2^n, cap_seconds)`.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Base delay in seconds before the first retry (default: 1.0)
    #[serde(default = "default_retry_base")]
    pub base_seconds: f64,

    /// Cap on the backoff delay in seconds (default: 300.0)
    #[serde(default = "default_retry_cap")]
    pub cap_seconds: f64,

    /// Maximum number of retries per item (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base(),
            cap_seconds: default_retry_cap(),
            max_retries: default_max_retries(),
        }
    }
}

/// Event bus configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct EventsConfig {
    /// Number of events retained in the in-memory history ring (default: 1000)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Data storage and state management
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PersistenceConfig {
    /// SQLite URL or path for the queue store (None = in-memory only)
    #[serde(default)]
    pub queue_store_url: Option<String>,

    /// Rules document path (default: "rules.json")
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,

    /// Days after which terminal item records expire (default: 7)
    #[serde(default = "default_terminal_ttl_days")]
    pub terminal_ttl_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_store_url: None,
            rules_file: default_rules_file(),
            terminal_ttl_days: default_terminal_ttl_days(),
        }
    }
}

/// aria2c transfer tuning for the yt-dlp+aria2c engine
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Aria2Options {
    /// Maximum connections per server (default: 16)
    #[serde(default = "default_aria2_connections")]
    pub max_connection_per_server: u32,

    /// Number of segments to split each file into (default: 16)
    #[serde(default = "default_aria2_split")]
    pub split: u32,

    /// Minimum split size (default: "1M")
    #[serde(default = "default_aria2_min_split")]
    pub min_split_size: String,

    /// Retries passed to aria2c itself (default: 5)
    #[serde(default = "default_aria2_tries")]
    pub max_tries: u32,

    /// Seconds aria2c waits between its own retries (default: 3)
    #[serde(default = "default_aria2_retry_wait")]
    pub retry_wait: u32,
}

impl Default for Aria2Options {
    fn default() -> Self {
        Self {
            max_connection_per_server: default_aria2_connections(),
            split: default_aria2_split(),
            min_split_size: default_aria2_min_split(),
            max_tries: default_aria2_tries(),
            retry_wait: default_aria2_retry_wait(),
        }
    }
}

/// streamlink recorder tuning
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct StreamlinkOptions {
    /// `--retry-streams` interval in seconds (default: 5)
    #[serde(default = "default_streamlink_retry_streams")]
    pub retry_streams: u32,

    /// `--retry-max` attempts (default: 10)
    #[serde(default = "default_streamlink_retry_max")]
    pub retry_max: u32,

    /// Optional recording duration in seconds (`--hls-duration`)
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

impl Default for StreamlinkOptions {
    fn default() -> Self {
        Self {
            retry_streams: default_streamlink_retry_streams(),
            retry_max: default_streamlink_retry_max(),
            duration_seconds: None,
        }
    }
}

/// gallery-dl scraper tuning
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct GalleryDlOptions {
    /// Download-archive file for skip tracking
    #[serde(default)]
    pub archive_file: Option<PathBuf>,

    /// Write per-file metadata JSON (default: true)
    #[serde(default = "default_true")]
    pub write_metadata: bool,
}

/// ripme image ripper configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RipmeOptions {
    /// Path to the ripme jar (default: "./ripme.jar")
    #[serde(default = "default_ripme_jar")]
    pub jar_path: PathBuf,
}

impl Default for RipmeOptions {
    fn default() -> Self {
        Self {
            jar_path: default_ripme_jar(),
        }
    }
}

/// Engine adapter configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct EnginesConfig {
    /// aria2c tuning for the yt-dlp+aria2c engine
    #[serde(default)]
    pub aria2: Aria2Options,

    /// streamlink tuning
    #[serde(default)]
    pub streamlink: StreamlinkOptions,

    /// gallery-dl tuning
    #[serde(default)]
    pub gallery_dl: GalleryDlOptions,

    /// ripme configuration
    #[serde(default)]
    pub ripme: RipmeOptions,
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Whether the API server should be started
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1:6791)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins ("*" or empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Main configuration for MediaDownloader
///
/// Fields are organized into logical sub-configs:
/// - [`queue`](QueueConfig) — concurrency, bandwidth, timeouts
/// - [`retry`](RetryConfig) — backoff parameters
/// - [`events`](EventsConfig) — history ring capacity
/// - [`persistence`](PersistenceConfig) — queue store and rules document
/// - [`engines`](EnginesConfig) — per-engine tool tuning
/// - [`api`](ApiConfig) — REST surface
///
/// Sub-config fields are flattened for a flat JSON/TOML format (no nesting),
/// except `persistence` and `api` which keep their own sections.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Queue behavior settings
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Retry/backoff settings
    #[serde(flatten)]
    pub retry: RetryConfig,

    /// Event bus settings
    #[serde(flatten)]
    pub events: EventsConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Engine adapter tuning
    #[serde(default)]
    pub engines: EnginesConfig,

    /// REST API settings
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.queue.download_dir
    }

    /// Validate cross-field constraints
    ///
    /// Called by `MediaDownloader::new` before any component is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_downloads < 1 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be >= 1".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }
        if self.retry.base_seconds < 0.0 {
            return Err(Error::Config {
                message: "retry base_seconds must be >= 0".to_string(),
                key: Some("base_seconds".to_string()),
            });
        }
        if self.retry.cap_seconds < self.retry.base_seconds {
            return Err(Error::Config {
                message: "retry cap_seconds must be >= base_seconds".to_string(),
                key: Some("cap_seconds".to_string()),
            });
        }
        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_item_bandwidth() -> u64 {
    1024 * 1024
}

fn default_grace_seconds() -> u64 {
    5
}

fn default_hard_timeout() -> u64 {
    3600
}

fn default_retry_base() -> f64 {
    1.0
}

fn default_retry_cap() -> f64 {
    300.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_history_capacity() -> usize {
    1000
}

fn default_rules_file() -> PathBuf {
    PathBuf::from("rules.json")
}

fn default_terminal_ttl_days() -> u32 {
    7
}

fn default_aria2_connections() -> u32 {
    16
}

fn default_aria2_split() -> u32 {
    16
}

fn default_aria2_min_split() -> String {
    "1M".to_string()
}

fn default_aria2_tries() -> u32 {
    5
}

fn default_aria2_retry_wait() -> u32 {
    3
}

fn default_streamlink_retry_streams() -> u32 {
    5
}

fn default_streamlink_retry_max() -> u32 {
    10
}

fn default_ripme_jar() -> PathBuf {
    PathBuf::from("./ripme.jar")
}

fn default_bind_address() -> SocketAddr {
    // Hard-coded literal always parses
    "127.0.0.1:6791".parse().unwrap_or_else(|_| {
        SocketAddr::from(([127, 0, 0, 1], 6791))
    })
}

fn default_true() -> bool {
    true
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_concurrent_downloads, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_seconds, 1.0);
        assert_eq!(config.retry.cap_seconds, 300.0);
        assert_eq!(config.events.history_capacity, 1000);
        assert_eq!(config.persistence.terminal_ttl_days, 7);
        assert!(config.queue.bandwidth_cap_bps.is_none());
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let config = Config {
            queue: QueueConfig {
                max_concurrent_downloads: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_downloads"));
    }

    #[test]
    fn retry_cap_below_base_fails_validation() {
        let config = Config {
            retry: RetryConfig {
                base_seconds: 10.0,
                cap_seconds: 5.0,
                max_retries: 3,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_from_empty_json_object() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.download_dir, PathBuf::from("./downloads"));
    }

    #[test]
    fn flattened_fields_deserialize_at_top_level() {
        let json = r#"{
            "max_concurrent_downloads": 5,
            "bandwidth_cap_bps": 10485760,
            "max_retries": 0,
            "history_capacity": 50
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.max_concurrent_downloads, 5);
        assert_eq!(config.queue.bandwidth_cap_bps, Some(10_485_760));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.events.history_capacity, 50);
    }

    #[test]
    fn persistence_section_deserializes_nested() {
        let json = r#"{"persistence": {"queue_store_url": "sqlite:queue.db"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.persistence.queue_store_url.as_deref(),
            Some("sqlite:queue.db")
        );
    }
}
