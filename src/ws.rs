//! WebSocket transport for browser taps.
//!
//! ## Connection lifecycle
//!
//! 1. A tap connects to `GET /api/tap?token=<key>&tab_id=<n>&url=<tab url>`
//!    (plus an optional `browser=Chrome/126` identity). The token is
//!    validated and the attach policy runs before the upgrade completes:
//!    paused capture or a privileged tab URL refuses the connection.
//! 2. The tap streams JSON events (see [`crate::capture::tap`]). Events are
//!    processed strictly in arrival order, one tab per socket.
//! 3. Body retrieval runs against the same socket: the engine sends
//!    `{"type":"getResponseBody","id":N,"requestId":...}` and the tap
//!    answers with a `responseBody` message echoing the correlation id.
//!    Replies are resolved by the socket reader, so retrieval for one
//!    request can complete while later events are still queued.
//! 4. On disconnect the tab counts as closed: its in-flight transactions
//!    are dropped without emit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::capture::capturable;
use crate::capture::tap::{BodyProvider, TapBody, TapEvent};
use crate::AppState;

/// How long a body-retrieval round trip may take before the entry is
/// emitted without its body.
const BODY_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameters for the tap upgrade request.
#[derive(Deserialize)]
pub struct TapQuery {
    /// API key passed as a query parameter (taps can't set headers on a
    /// WebSocket upgrade).
    pub token: String,
    pub tab_id: i64,
    /// Current URL of the tab, checked against the capturable policy.
    pub url: String,
    /// Browser identity, e.g. `Chrome/126.0.64`.
    #[serde(default)]
    pub browser: Option<String>,
}

/// `GET /api/tap` — tap WebSocket upgrade handler.
///
/// Refuses the attach with `403` on a bad token or privileged URL and `409`
/// while capture is paused. Refusals are logged and otherwise silent — the
/// tab is simply not captured.
pub async fn tap_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let key = crate::auth::ApiKey(state.config.auth.api_key.clone());
    if !key.verify(&query.token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    if state.settings.get().paused {
        debug!("tap attach refused for tab {}: capture paused", query.tab_id);
        return (StatusCode::CONFLICT, "Capture is paused").into_response();
    }
    if !capturable(&query.url) {
        debug!("tap attach refused for tab {}: privileged URL", query.tab_id);
        return (StatusCode::FORBIDDEN, "Tab is not capturable").into_response();
    }

    ws.on_upgrade(move |socket| handle_tap(socket, state, query))
}

/// Correlates `getResponseBody` requests with their `responseBody` replies.
struct TapChannel {
    out_tx: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<TapBody>>>,
    next_id: AtomicU64,
}

impl TapChannel {
    fn new(out_tx: mpsc::Sender<String>) -> Self {
        Self {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn resolve(&self, id: u64, body: TapBody) {
        if let Some(tx) = self.pending.lock().await.remove(&id) {
            let _ = tx.send(body);
        }
    }
}

impl BodyProvider for TapChannel {
    async fn fetch_body(&self, request_id: &str) -> Result<TapBody, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "type": "getResponseBody",
            "id": id,
            "requestId": request_id,
        })
        .to_string();
        if self.out_tx.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err("tap channel closed".to_string());
        }

        match tokio::time::timeout(BODY_TIMEOUT, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err("tap channel closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err("body retrieval timed out".to_string())
            }
        }
    }
}

async fn handle_tap(socket: WebSocket, state: AppState, query: TapQuery) {
    let tab_id = query.tab_id;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
    let channel = Arc::new(TapChannel::new(out_tx));

    state
        .capture
        .attach_tab(tab_id, query.url.clone(), query.browser.clone(), close_tx)
        .await;
    info!("tap attached for tab {tab_id} ({})", query.url);

    // Writer: drains engine → tap requests.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: resolves body replies immediately, queues everything else in
    // arrival order for the processing loop below.
    let (event_tx, mut event_rx) = mpsc::channel::<TapEvent>(256);
    let reader_channel = Arc::clone(&channel);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<TapEvent>(&text) {
                    Ok(TapEvent::ResponseBody {
                        id,
                        body,
                        base64_encoded,
                    }) => {
                        reader_channel
                            .resolve(
                                id,
                                TapBody {
                                    body,
                                    base64_encoded,
                                },
                            )
                            .await;
                    }
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("unparseable tap message from tab {tab_id}: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            _ = close_rx.recv() => {
                debug!("tap for tab {tab_id} detached by the engine");
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    TapEvent::Navigated { url } => {
                        if !state.capture.tab_navigated(tab_id, &url).await {
                            info!("tab {tab_id} navigated to a privileged URL, detaching");
                            break;
                        }
                    }
                    other => state.capture.handle_event(tab_id, other, channel.as_ref()).await,
                }
            }
        }
    }

    state.capture.tab_closed(tab_id).await;
    reader.abort();
    writer.abort();
    info!("tap for tab {tab_id} closed");
}
