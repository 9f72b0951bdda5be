//! Clip creation endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::clip::{ClipError, ClipRequest};
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClipRequest {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub tab_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub clip_name: Option<String>,
}

/// `POST /api/clips` — build, sanitize, and ship a clip.
///
/// An empty time window is fine; the clip ships with `entry_count` 0. A
/// dropped connection cancels the clip before the row write.
pub async fn create_clip(
    State(state): State<AppState>,
    Json(payload): Json<CreateClipRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let summary = state
        .clips
        .create_clip(ClipRequest {
            start_ms: payload.start_time,
            end_ms: payload.end_time,
            tab_ids: payload.tab_ids,
            name: payload.clip_name,
        })
        .await
        .map_err(|e| {
            let status = match &e {
                ClipError::InvalidRange => StatusCode::BAD_REQUEST,
                ClipError::ConfigMissing => StatusCode::PRECONDITION_FAILED,
                ClipError::Upload(_) => StatusCode::BAD_GATEWAY,
                ClipError::Store(_) | ClipError::Serialize(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error!("clip failed: {e}");
            (
                status,
                Json(json!({
                    "success": false,
                    "error": e.to_string(),
                    "entry_count": 0,
                    "size_bytes": 0,
                })),
            )
        })?;

    let mut body = json!({
        "success": true,
        "clip_id": summary.clip_id,
        "entry_count": summary.entry_count,
        "size_bytes": summary.size_bytes,
    });
    if let Some(ref path) = summary.storage_path {
        body["storage_path"] = json!(path);
    }
    Ok(Json(body))
}
