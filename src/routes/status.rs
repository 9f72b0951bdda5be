//! Status endpoints for the capture engine, buffer, and storage.
//!
//! - `GET /api/status`  — composite overview (popup main view)
//! - `GET /api/capture` — attachment and in-flight state
//! - `GET /api/buffer`  — span, per-stream counts, last cleanup
//! - `GET /api/storage` — usage, quota, cap, pressure

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::store::Stream;
use crate::AppState;

/// `GET /api/status` — composite status for the control surface.
pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let settings = state.settings.get();
    let tabs = state.capture.attached_tabs().await;
    let span = state.buffer.span().await;
    let usage = state.buffer.usage_status().await;

    let tabs_json: Vec<Value> = tabs
        .iter()
        .map(|(id, url)| json!({"tab_id": id, "url": url}))
        .collect();

    Json(json!({
        "capturing": !settings.paused,
        "paused": settings.paused,
        "attached_tabs": tabs_json,
        "buffer": {
            "oldest_ts": span.oldest_ts,
            "newest_ts": span.newest_ts,
            "duration_ms": span.duration_ms,
            "usage_bytes": usage.usage_bytes,
            "cap_bytes": usage.cap_bytes,
            "pressure": usage.pressure,
            "truncated": usage.truncated,
        },
        "settings": {
            "storage_cap_class": settings.storage_cap_class,
            "default_scope": settings.default_scope,
            "sanitize_url_params": settings.sanitize_url_params,
            "custom_header_patterns": settings.custom_header_patterns,
            "endpoint_configured": settings.endpoint_url.is_some() && settings.endpoint_key.is_some(),
        },
    }))
}

/// `GET /api/capture` — attachment and in-flight transaction state.
pub async fn get_capture_status(State(state): State<AppState>) -> Json<Value> {
    let paused = state.settings.get().paused;
    let tabs = state.capture.attached_tabs().await;
    let (pending_http, open_websockets) = state.capture.inflight().await;

    let tabs_json: Vec<Value> = tabs
        .iter()
        .map(|(id, url)| json!({"tab_id": id, "url": url}))
        .collect();

    Json(json!({
        "paused": paused,
        "attached_tabs": tabs_json,
        "pending_http": pending_http,
        "open_websockets": open_websockets,
    }))
}

/// `GET /api/buffer` — buffer span and per-stream record counts.
pub async fn get_buffer_status(State(state): State<AppState>) -> Json<Value> {
    let span = state.buffer.span().await;
    let mut counts = serde_json::Map::new();
    for stream in Stream::ALL {
        let n = state.store.count(stream).await.unwrap_or(0);
        counts.insert(stream.as_str().to_string(), json!(n));
    }
    let last_cleanup: Option<i64> = state.store.get_meta("last-cleanup").await.unwrap_or(None);
    let last_usage: Option<u64> = state.store.get_meta("last-usage-bytes").await.unwrap_or(None);

    Json(json!({
        "oldest_ts": span.oldest_ts,
        "newest_ts": span.newest_ts,
        "duration_ms": span.duration_ms,
        "counts": counts,
        "last_cleanup": last_cleanup,
        "last_usage_bytes": last_usage,
    }))
}

/// `GET /api/storage` — on-disk usage against quota and cap.
pub async fn get_storage_status(State(state): State<AppState>) -> Json<Value> {
    let usage = state.buffer.usage_status().await;
    Json(json!({
        "usage_bytes": usage.usage_bytes,
        "quota_bytes": usage.quota_bytes,
        "cap_bytes": usage.cap_bytes,
        "pressure": usage.pressure,
        "truncated": usage.truncated,
    }))
}
