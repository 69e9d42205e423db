//! Playlist URL classification
//!
//! Pure pattern matching against a small closed set of playlist-bearing
//! platforms, plus platform-local id extraction. No I/O; actual expansion
//! into children is the engine adapter's job at admission.

use regex::Regex;
use std::sync::OnceLock;

/// A recognized playlist URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistRef {
    /// Platform that hosts the playlist
    pub platform: &'static str,
    /// Platform-local playlist id
    pub id: String,
}

struct PlatformPatterns {
    platform: &'static str,
    patterns: Vec<Regex>,
}

fn platform_patterns() -> &'static Vec<PlatformPatterns> {
    static PATTERNS: OnceLock<Vec<PlatformPatterns>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |exprs: &[&str]| -> Vec<Regex> {
            exprs
                .iter()
                .filter_map(|e| Regex::new(&format!("(?i){e}")).ok())
                .collect()
        };
        vec![
            PlatformPatterns {
                platform: "youtube",
                patterns: compile(&[
                    r"youtube\.com/playlist\?list=",
                    r"youtube\.com/watch\?.*&list=",
                ]),
            },
            PlatformPatterns {
                platform: "spotify",
                patterns: compile(&[r"spotify\.com/playlist/", r"spotify\.com/album/"]),
            },
            PlatformPatterns {
                platform: "soundcloud",
                patterns: compile(&[r"soundcloud\.com/.*/sets/"]),
            },
        ]
    })
}

fn id_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"list=([^&]+)",
            r"/(?:playlist|album)/([^/?]+)",
            r"/sets/([^/?]+)",
        ]
        .iter()
        .filter_map(|e| Regex::new(e).ok())
        .collect()
    })
}

/// Classify a URL as a playlist, returning the platform and local id
///
/// Returns None for single-item URLs and for playlist-shaped URLs whose id
/// cannot be extracted.
pub fn detect_playlist(url: &str) -> Option<PlaylistRef> {
    let platform = platform_patterns()
        .iter()
        .find(|p| p.patterns.iter().any(|re| re.is_match(url)))
        .map(|p| p.platform)?;
    let id = extract_playlist_id(url)?;
    Some(PlaylistRef { platform, id })
}

/// Extract the platform-local playlist id from a URL
pub fn extract_playlist_id(url: &str) -> Option<String> {
    id_patterns()
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
