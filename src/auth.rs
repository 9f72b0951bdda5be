//! Pre-shared key authentication for the control plane and tap ingest.
//!
//! Both surfaces authenticate against the same configured key but present
//! it differently: REST clients send `Authorization: Bearer <key>`, while
//! taps pass `?token=<key>` on the WebSocket upgrade (browsers cannot set
//! headers there). [`ApiKey`] owns the comparison so both paths share one
//! constant-time check. The key comes from `[auth] api_key` or the
//! `CLIPD_API_KEY` env var.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// The expected API key, injected into the router as an extension so
/// [`require_api_key`] can reach it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

impl ApiKey {
    /// Constant-time comparison of a presented token against the key.
    ///
    /// Accumulates the XOR of every byte position across the longer of the
    /// two lengths, with distinct fill bytes past each end, so neither an
    /// early mismatch nor a short token changes the work done.
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        let mut acc = expected.len() ^ presented.len();
        for i in 0..expected.len().max(presented.len()) {
            let e = expected.get(i).copied().unwrap_or(0x5a);
            let p = presented.get(i).copied().unwrap_or(0xa5);
            acc |= usize::from(e ^ p);
        }
        acc == 0
    }
}

/// Pull the Bearer token out of the request headers, if any.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Axum middleware guarding the control-plane routes.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but invalid
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let verdict = match request.extensions().get::<ApiKey>() {
        None => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
        )),
        Some(key) => match bearer_token(request.headers()) {
            Some(token) if key.verify(token) => Ok(()),
            Some(_) => Err((StatusCode::FORBIDDEN, "Invalid API key")),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Missing or invalid Authorization header",
            )),
        },
    };
    match verdict {
        Ok(()) => next.run(request).await,
        Err((status, message)) => {
            (status, Json(json!({"error": message}))).into_response()
        }
    }
}
