//! Capture control and settings endpoints.
//!
//! - `POST   /api/capture/pause`  — halt capture, detach all taps
//! - `POST   /api/capture/resume` — allow taps to reconnect
//! - `DELETE /api/buffer`         — wipe the three streams
//! - `POST   /api/cleanup`        — run a buffer manager pass now
//! - `POST   /api/remote/test`    — probe an endpoint/key pair
//! - `GET    /api/settings`       — read runtime settings
//! - `PATCH  /api/settings`       — update runtime settings

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{CapClass, ClipScope};
use crate::uploader::{RemoteStore, UploadError};
use crate::AppState;

/// `POST /api/capture/pause` — halt capture. The settings watcher tears
/// down the pipeline and closes every tap channel.
pub async fn pause_capture(State(state): State<AppState>) -> Json<Value> {
    state.set_paused(true).await;
    Json(json!({"ok": true, "paused": true}))
}

/// `POST /api/capture/resume` — re-enable capture. Taps reconnect on their
/// own; nothing to tear down.
pub async fn resume_capture(State(state): State<AppState>) -> Json<Value> {
    state.set_paused(false).await;
    Json(json!({"ok": true, "paused": false}))
}

/// `DELETE /api/buffer` — wipe all three streams.
pub async fn clear_buffer(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.store.clear_all().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;
    Ok(Json(json!({"ok": true})))
}

/// `POST /api/cleanup` — trigger a buffer manager pass immediately.
pub async fn run_cleanup(State(state): State<AppState>) -> Json<Value> {
    state.buffer.run().await;
    Json(json!({"ok": true}))
}

#[derive(Deserialize)]
pub struct TestRemoteRequest {
    pub url: String,
    pub key: String,
}

/// `POST /api/remote/test` — probe a remote endpoint/key pair without
/// saving it.
pub async fn test_remote(
    Json(payload): Json<TestRemoteRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match RemoteStore::test_connection(&payload.url, &payload.key).await {
        Ok(()) => Ok(Json(json!({"ok": true}))),
        Err(UploadError::Remote { status, body }) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "status": status, "error": body})),
        )),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error": e.to_string()})),
        )),
    }
}

/// `GET /api/settings` — current runtime settings.
pub async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    let s = state.settings.get();
    Json(json!({
        "paused": s.paused,
        "storage_cap_class": s.storage_cap_class,
        "default_scope": s.default_scope,
        "sanitize_url_params": s.sanitize_url_params,
        "custom_header_patterns": s.custom_header_patterns,
        "endpoint_url": s.endpoint_url,
        "endpoint_configured": s.endpoint_url.is_some() && s.endpoint_key.is_some(),
    }))
}

#[derive(Deserialize)]
pub struct SettingsPatch {
    pub storage_cap_class: Option<CapClass>,
    pub default_scope: Option<ClipScope>,
    pub sanitize_url_params: Option<bool>,
    pub custom_header_patterns: Option<Vec<String>>,
    pub endpoint_url: Option<String>,
    pub endpoint_key: Option<String>,
}

/// `PATCH /api/settings` — update runtime settings. A cap class change
/// triggers an immediate buffer manager pass via the settings watcher.
pub async fn patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Json<Value> {
    state.settings.update(|s| {
        if let Some(cap) = patch.storage_cap_class {
            s.storage_cap_class = cap;
        }
        if let Some(scope) = patch.default_scope {
            s.default_scope = scope;
        }
        if let Some(flag) = patch.sanitize_url_params {
            s.sanitize_url_params = flag;
        }
        if let Some(ref patterns) = patch.custom_header_patterns {
            s.custom_header_patterns = patterns.clone();
        }
        if let Some(ref url) = patch.endpoint_url {
            s.endpoint_url = Some(url.clone());
        }
        if let Some(ref key) = patch.endpoint_key {
            s.endpoint_key = Some(key.clone());
        }
    });
    Json(json!({"ok": true}))
}
