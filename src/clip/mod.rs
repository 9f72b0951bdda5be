//! Clip building: snapshot → extended HAR → sanitize → upload.
//!
//! A clip materializes an immutable snapshot of the rolling buffer for one
//! (time range, tab set) filter, assembles the extended HAR document,
//! sanitizes it, serializes once, and routes the result by size: documents
//! under 1 MiB travel inline in the clip row, larger ones are written to a
//! storage blob first with the row carrying only the path.
//!
//! Every phase boundary is an await point, so a caller dropping the future
//! aborts the clip without partial writes — the row insert is always last.

pub mod har;
pub mod sanitize;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::CapturePipeline;
use crate::config::SettingsHandle;
use crate::store::{HttpEntry, SseEvent, Store, StoreError, WsFrame};
use crate::uploader::{ClipRow, RemoteStore, TabFilter, UploadError};
use self::har::iso_ms;
use self::sanitize::Sanitizer;

/// Serialized documents strictly under this many bytes are inlined.
pub const INLINE_LIMIT: usize = 1024 * 1024;

/// Whether a serialized document of `size` bytes travels inline in the row.
pub fn routes_inline(size: usize) -> bool {
    size < INLINE_LIMIT
}

/// Storage object name for an oversized clip: the ISO timestamp with colons
/// and dots replaced by dashes.
pub fn blob_filename(now_ms: i64) -> String {
    let stamp = iso_ms(now_ms).replace([':', '.'], "-");
    format!("clip-{stamp}.json")
}

/// An immutable read of the three streams for one filter.
pub struct Snapshot {
    pub http: Vec<HttpEntry>,
    pub ws: Vec<WsFrame>,
    pub sse: Vec<SseEvent>,
}

impl Snapshot {
    /// Total records across the three streams.
    pub fn entry_count(&self) -> usize {
        self.http.len() + self.ws.len() + self.sse.len()
    }
}

/// One clip request from the control plane.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub start_ms: i64,
    pub end_ms: i64,
    /// `None` captures all tabs.
    pub tab_ids: Option<Vec<i64>>,
    pub name: Option<String>,
}

/// A successfully shipped clip.
#[derive(Debug, Clone)]
pub struct ClipSummary {
    pub clip_id: String,
    pub entry_count: u64,
    pub size_bytes: u64,
    /// Set when the document was routed to a storage blob.
    pub storage_path: Option<String>,
}

/// Clip failures — all surfaced to the caller, unlike capture-time errors.
#[derive(Debug)]
pub enum ClipError {
    /// `start_ms` was greater than `end_ms`.
    InvalidRange,
    /// No remote endpoint configured.
    ConfigMissing,
    /// Snapshot read failed.
    Store(StoreError),
    /// Document serialization failed.
    Serialize(serde_json::Error),
    /// Blob or row write failed.
    Upload(UploadError),
}

impl fmt::Display for ClipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClipError::InvalidRange => write!(f, "start time must not exceed end time"),
            ClipError::ConfigMissing => {
                write!(f, "remote endpoint not configured — set endpoint URL and key")
            }
            ClipError::Store(e) => write!(f, "snapshot read failed: {e}"),
            ClipError::Serialize(e) => write!(f, "clip serialization failed: {e}"),
            ClipError::Upload(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClipError {}

impl From<StoreError> for ClipError {
    fn from(e: StoreError) -> Self {
        ClipError::Store(e)
    }
}

impl From<UploadError> for ClipError {
    fn from(e: UploadError) -> Self {
        ClipError::Upload(e)
    }
}

/// Builds and ships clips.
pub struct ClipBuilder {
    store: Arc<Store>,
    capture: Arc<CapturePipeline>,
    settings: SettingsHandle,
    bucket: String,
}

impl ClipBuilder {
    pub fn new(
        store: Arc<Store>,
        capture: Arc<CapturePipeline>,
        settings: SettingsHandle,
        bucket: String,
    ) -> Self {
        Self {
            store,
            capture,
            settings,
            bucket,
        }
    }

    /// Read a consistent snapshot of the three streams for one filter.
    pub async fn snapshot(
        &self,
        start_ms: i64,
        end_ms: i64,
        tabs: Option<&HashSet<i64>>,
    ) -> Result<Snapshot, StoreError> {
        Ok(Snapshot {
            http: self.store.scan(start_ms, end_ms, tabs).await?,
            ws: self.store.scan(start_ms, end_ms, tabs).await?,
            sse: self.store.scan(start_ms, end_ms, tabs).await?,
        })
    }

    /// Build, sanitize, and ship one clip. An empty result set is not an
    /// error — the skeleton document is shipped with `entry_count` 0.
    pub async fn create_clip(&self, req: ClipRequest) -> Result<ClipSummary, ClipError> {
        if req.start_ms > req.end_ms {
            return Err(ClipError::InvalidRange);
        }
        let settings = self.settings.get();
        let (endpoint, key) = match (&settings.endpoint_url, &settings.endpoint_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
                (url.clone(), key.clone())
            }
            _ => return Err(ClipError::ConfigMissing),
        };

        let tabs: Option<HashSet<i64>> =
            req.tab_ids.as_ref().map(|ids| ids.iter().copied().collect());
        let snapshot = self.snapshot(req.start_ms, req.end_ms, tabs.as_ref()).await?;
        let entry_count = snapshot.entry_count() as u64;

        let browser = self.capture.browser_info().await;
        let mut doc = har::build(&snapshot, browser);
        Sanitizer::new(&settings.custom_header_patterns, settings.sanitize_url_params)
            .sanitize(&mut doc);

        let serialized = serde_json::to_vec(&doc).map_err(ClipError::Serialize)?;
        let size_bytes = serialized.len() as u64;

        let remote = RemoteStore::new(&endpoint, &key, &self.bucket)?;
        let mut row = ClipRow {
            clip_name: req.name,
            time_range_start: iso_ms(req.start_ms),
            time_range_end: iso_ms(req.end_ms),
            duration_seconds: (req.end_ms - req.start_ms) / 1000,
            tab_filter: match req.tab_ids {
                Some(tabs) => TabFilter::Tabs { tabs },
                None => TabFilter::All,
            },
            entry_count,
            total_size_bytes: size_bytes,
            har_data: None,
            storage_path: None,
        };

        let storage_path = if routes_inline(serialized.len()) {
            row.har_data = Some(serde_json::to_value(&doc).map_err(ClipError::Serialize)?);
            None
        } else {
            // Blob first; a blob failure aborts the clip before any row exists.
            let filename = blob_filename(crate::store::now_ms());
            remote.upload_blob(&filename, serialized).await?;
            row.storage_path = Some(filename.clone());
            Some(filename)
        };

        let response = match remote.insert_clip_row(&row).await {
            Ok(body) => body,
            Err(e) => {
                if let Some(ref path) = storage_path {
                    // Orphaned blob is tolerated; a sweep can reclaim it later.
                    warn!("clip row write failed after blob upload, orphan blob {path}: {e}");
                }
                return Err(e.into());
            }
        };

        // `Prefer: return=representation` echoes the inserted row; fall back
        // to a local id when the remote returns something unexpected.
        let clip_id = response
            .get(0)
            .and_then(|row| row.get("id"))
            .map(|id| match id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!(
            "clip {clip_id} shipped: {entry_count} entries, {size_bytes} bytes, {}",
            if storage_path.is_some() { "blob" } else { "inline" }
        );

        Ok(ClipSummary {
            clip_id,
            entry_count,
            size_bytes,
            storage_path,
        })
    }
}
