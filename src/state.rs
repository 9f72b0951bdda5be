//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::BufferManager;
use crate::capture::CapturePipeline;
use crate::clip::ClipBuilder;
use crate::config::{Config, SettingsHandle};
use crate::store::Store;

/// Shared application state for the clipd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The rolling capture store.
    pub store: Arc<Store>,
    /// Ingestion pipeline; owns the pending-HTTP and open-WS maps.
    pub capture: Arc<CapturePipeline>,
    /// Runtime settings (reactive).
    pub settings: SettingsHandle,
    /// Age and cap enforcement.
    pub buffer: Arc<BufferManager>,
    /// Clip building and shipping.
    pub clips: Arc<ClipBuilder>,
}

impl AppState {
    /// Flip the paused flag. The settings watcher reacts by detaching taps
    /// (or letting them reconnect); the flag is mirrored into store metadata
    /// so it survives restarts.
    pub async fn set_paused(&self, paused: bool) {
        self.settings.update(|s| s.paused = paused);
        if let Err(e) = self.store.put_meta("paused", &paused).await {
            tracing::warn!("failed to persist paused flag: {e}");
        }
    }
}
