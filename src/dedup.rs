//! Duplicate detection via normalized URL and title hashes
//!
//! URLs are normalized (lowercased host, tracking query parameters removed)
//! and hashed into an in-memory set; titles get an independent set fed on
//! successful completion. Only the URL set gates admission. Both sets are
//! repopulated from persisted items on restart.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use url::Url;

/// Tracking query parameters stripped during URL normalization
const TRACKING_PARAMS: &[&str] = &["ref", "source"];

/// In-memory duplicate detector owned by the scheduler actor
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    url_hashes: HashSet<String>,
    title_hashes: HashSet<String>,
}

impl DuplicateDetector {
    /// Create an empty detector
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a URL normalizes to one already tracked
    pub fn is_known_url(&self, url: &str) -> bool {
        self.url_hashes.contains(&hash(&normalize_url(url)))
    }

    /// Whether a title normalizes to one already tracked
    pub fn is_known_title(&self, title: &str) -> bool {
        self.title_hashes.contains(&hash(&normalize_title(title)))
    }

    /// Track a URL
    pub fn add_url(&mut self, url: &str) {
        self.url_hashes.insert(hash(&normalize_url(url)));
    }

    /// Track a title
    pub fn add_title(&mut self, title: &str) {
        self.title_hashes.insert(hash(&normalize_title(title)));
    }

    /// Forget a URL (used when purging terminal items)
    pub fn remove_url(&mut self, url: &str) {
        self.url_hashes.remove(&hash(&normalize_url(url)));
    }

    /// Number of tracked URLs
    pub fn url_count(&self) -> usize {
        self.url_hashes.len()
    }
}

/// Normalize a URL for duplicate comparison
///
/// Lowercases the whole URL, drops `utm_*`/`ref`/`source` query parameters
/// and any fragment. Unparseable URLs fall back to plain lowercasing.
fn normalize_url(url: &str) -> String {
    let lowered = url.to_lowercase();
    let Ok(mut parsed) = Url::parse(&lowered) else {
        return lowered;
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    parsed.set_fragment(None);
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query: String = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    parsed.to_string()
}

/// Normalize a title: lowercase and strip everything but word characters
/// and single spaces.
fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_space = true;
    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            last_space = false;
        } else if c.is_whitespace() && !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        // Writing to a String cannot fail
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
