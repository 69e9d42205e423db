//! Application state for the API server

use crate::{Config, MediaDownloader};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned per request (cheap: the downloader itself is Arc-backed).
#[derive(Clone)]
pub struct AppState {
    /// The main MediaDownloader instance
    pub downloader: MediaDownloader,

    /// Configuration (read access; runtime changes go through the downloader)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(downloader: MediaDownloader, config: Arc<Config>) -> Self {
        Self { downloader, config }
    }
}
