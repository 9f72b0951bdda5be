//! Capture pipeline: raw tap events → normalized store records.
//!
//! The pipeline owns two in-memory maps nobody else touches: pending HTTP
//! transactions (keyed by request id) and open WebSockets (keyed by
//! connection id). HTTP entries are emitted to the store only on terminal
//! transitions — loaded, failed, or a redirect hop being superseded — so a
//! crash mid-transaction loses at most the in-flight record.
//!
//! ## HTTP state machine (per request id)
//!
//! ```text
//! INIT --[requestWillBeSent]--> PENDING
//! PENDING --[responseReceived]--> PENDING_WITH_RESPONSE
//! PENDING_WITH_RESPONSE --[loadingFinished]--> emit
//! PENDING | PENDING_WITH_RESPONSE --[loadingFailed]--> emit with error
//! PENDING --[requestWillBeSent + redirectResponse]--> emit prior hop,
//!                                                     re-pend the new hop
//! any --[tab closed]--> drop without emit
//! ```
//!
//! Bodies are fetched from the tap only when the encoded size is at most
//! 5 MiB; larger responses are stored with the size and no text. Headers
//! are stored raw — sanitization happens at clip time so policy changes
//! never invalidate the buffer.

pub mod tap;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::store::{
    hostname_of, Content, Envelope, FrameDirection, HttpEntry, HttpRequest, HttpResponse,
    NameValue, PostData, SseEvent, Store, WsFrame,
};
use self::tap::{secs_to_ms, BodyProvider, TapEvent, TapRequest, TapResponse};

/// Responses with an encoded size above this never have their body retrieved.
pub const BODY_SIZE_LIMIT: i64 = 5 * 1024 * 1024;

/// URL prefixes of privileged browser surfaces that are never captured.
const PRIVILEGED_PREFIXES: [&str; 6] = [
    "chrome://",
    "chrome-extension://",
    "edge://",
    "about:",
    "devtools://",
    "chrome-devtools://",
];

/// Whether a tab URL is eligible for capture.
pub fn capturable(url: &str) -> bool {
    !PRIVILEGED_PREFIXES.iter().any(|p| url.starts_with(p))
}

/// An in-flight HTTP transaction.
struct PendingHttp {
    tab_id: i64,
    /// Tap-reported start time, milliseconds.
    ts: i64,
    /// Local observation instant, for elapsed-time accounting.
    observed: Instant,
    url: String,
    request: HttpRequest,
    resource_type: String,
    response: Option<TapResponse>,
}

/// An open WebSocket connection.
struct OpenWs {
    url: String,
    tab_id: i64,
}

/// An attached tap channel.
pub struct AttachedTab {
    pub url: String,
    /// Browser identity string the tap reported at attach (`"Chrome/126"`).
    pub browser: Option<String>,
    close_tx: mpsc::Sender<()>,
}

#[derive(Default)]
struct PipelineState {
    pending: HashMap<String, PendingHttp>,
    open_ws: HashMap<String, OpenWs>,
    tabs: HashMap<i64, AttachedTab>,
}

/// Converts raw tap events into store records. Sole mutator of the
/// pending-HTTP and open-WS maps.
pub struct CapturePipeline {
    store: Arc<Store>,
    state: Mutex<PipelineState>,
}

impl CapturePipeline {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state: Mutex::new(PipelineState::default()),
        }
    }

    // ─── Tab attachment ──────────────────────────────────────────────────────

    /// Register a tap channel for a tab. A previous channel for the same tab
    /// is asked to close.
    pub async fn attach_tab(
        &self,
        tab_id: i64,
        url: String,
        browser: Option<String>,
        close_tx: mpsc::Sender<()>,
    ) {
        let mut st = self.state.lock().await;
        if let Some(old) = st.tabs.insert(
            tab_id,
            AttachedTab {
                url,
                browser,
                close_tx,
            },
        ) {
            let _ = old.close_tx.try_send(());
        }
    }

    /// Tab navigated to a new URL. Returns false when the new URL is not
    /// capturable — the transport detaches in that case.
    pub async fn tab_navigated(&self, tab_id: i64, url: &str) -> bool {
        let ok = capturable(url);
        let mut st = self.state.lock().await;
        if let Some(tab) = st.tabs.get_mut(&tab_id) {
            tab.url = url.to_string();
        }
        ok
    }

    /// Tab closed (or its tap disconnected): drop its in-flight transactions
    /// and open sockets without emitting.
    pub async fn tab_closed(&self, tab_id: i64) {
        let mut st = self.state.lock().await;
        st.tabs.remove(&tab_id);
        st.pending.retain(|_, p| p.tab_id != tab_id);
        st.open_ws.retain(|_, w| w.tab_id != tab_id);
    }

    /// Pause capture: tear down both maps and close every tap channel.
    pub async fn pause(&self) {
        let mut st = self.state.lock().await;
        st.pending.clear();
        st.open_ws.clear();
        for (_, tab) in st.tabs.drain() {
            let _ = tab.close_tx.try_send(());
        }
    }

    /// Currently attached tabs as `(tab_id, url)` pairs.
    pub async fn attached_tabs(&self) -> Vec<(i64, String)> {
        let st = self.state.lock().await;
        let mut tabs: Vec<(i64, String)> =
            st.tabs.iter().map(|(id, t)| (*id, t.url.clone())).collect();
        tabs.sort_by_key(|(id, _)| *id);
        tabs
    }

    /// Browser name and major version from the most recent attach, when the
    /// tap reported one (`"Chrome/126.0.64"` → `("Chrome", "126")`).
    pub async fn browser_info(&self) -> Option<(String, String)> {
        let st = self.state.lock().await;
        st.tabs.values().find_map(|t| {
            let raw = t.browser.as_deref()?;
            let (name, version) = raw.split_once('/')?;
            let major = version.split('.').next().unwrap_or(version);
            Some((name.to_string(), major.to_string()))
        })
    }

    /// In-flight counts `(pending_http, open_websockets)` for status queries.
    pub async fn inflight(&self) -> (usize, usize) {
        let st = self.state.lock().await;
        (st.pending.len(), st.open_ws.len())
    }

    // ─── Event ingestion ─────────────────────────────────────────────────────

    /// Dispatch one tap event. Ingestion errors are logged, never surfaced:
    /// a failing record is emitted with best-available fields or dropped.
    pub async fn handle_event<B: BodyProvider>(&self, tab_id: i64, event: TapEvent, body: &B) {
        match event {
            TapEvent::RequestWillBeSent {
                request_id,
                request,
                timestamp,
                resource_type,
                redirect_response,
            } => {
                self.on_request(
                    tab_id,
                    request_id,
                    request,
                    timestamp,
                    resource_type,
                    redirect_response,
                )
                .await;
            }
            TapEvent::ResponseReceived {
                request_id,
                response,
            } => {
                let mut st = self.state.lock().await;
                if let Some(p) = st.pending.get_mut(&request_id) {
                    p.response = Some(response);
                }
            }
            TapEvent::LoadingFinished {
                request_id,
                encoded_data_length,
            } => {
                self.on_finished(request_id, encoded_data_length, body).await;
            }
            TapEvent::LoadingFailed {
                request_id,
                error_text,
            } => {
                self.on_failed(request_id, error_text).await;
            }
            TapEvent::WebSocketCreated { request_id, url } => {
                let mut st = self.state.lock().await;
                st.open_ws.insert(request_id, OpenWs { url, tab_id });
            }
            TapEvent::WebSocketFrameSent {
                request_id,
                timestamp,
                frame,
            } => {
                self.on_ws_frame(request_id, timestamp, frame, FrameDirection::Send)
                    .await;
            }
            TapEvent::WebSocketFrameReceived {
                request_id,
                timestamp,
                frame,
            } => {
                self.on_ws_frame(request_id, timestamp, frame, FrameDirection::Receive)
                    .await;
            }
            TapEvent::WebSocketClosed { request_id } => {
                let mut st = self.state.lock().await;
                st.open_ws.remove(&request_id);
            }
            TapEvent::EventSourceMessage {
                request_id,
                timestamp,
                event_name,
                event_id,
                data,
            } => {
                self.on_sse(tab_id, request_id, timestamp, event_name, event_id, data)
                    .await;
            }
            // Transport-level messages; the WS handler intercepts these.
            TapEvent::Navigated { .. } | TapEvent::ResponseBody { .. } => {}
        }
    }

    async fn on_request(
        &self,
        tab_id: i64,
        request_id: String,
        request: TapRequest,
        timestamp: f64,
        resource_type: Option<String>,
        redirect_response: Option<TapResponse>,
    ) {
        let ts = secs_to_ms(timestamp);
        let prior_hop = {
            let mut st = self.state.lock().await;
            let prior = match &redirect_response {
                Some(redirect) => st
                    .pending
                    .remove(&request_id)
                    .map(|p| redirect_hop_entry(&request_id, p, redirect, &request.url)),
                None => None,
            };
            st.pending.insert(
                request_id,
                PendingHttp {
                    tab_id,
                    ts,
                    observed: Instant::now(),
                    url: request.url.clone(),
                    request: normalize_request(&request),
                    resource_type: resource_type.unwrap_or_else(|| "other".to_string()),
                    response: None,
                },
            );
            prior
        };
        if let Some(entry) = prior_hop {
            self.emit_http(entry).await;
        }
    }

    async fn on_finished<B: BodyProvider>(&self, request_id: String, encoded: f64, body: &B) {
        let pending = {
            let mut st = self.state.lock().await;
            st.pending.remove(&request_id)
        };
        let Some(p) = pending else {
            debug!("loadingFinished for unknown request {request_id}");
            return;
        };

        let size = encoded.round() as i64;
        let mut content = Content {
            size,
            mime_type: p
                .response
                .as_ref()
                .and_then(|r| r.mime_type.clone())
                .unwrap_or_default(),
            text: None,
            encoding: None,
        };
        if size <= BODY_SIZE_LIMIT {
            match body.fetch_body(&request_id).await {
                Ok(b) => {
                    content.text = Some(b.body);
                    if b.base64_encoded {
                        content.encoding = Some("base64".to_string());
                    }
                }
                Err(e) => debug!("response body unavailable for {request_id}: {e}"),
            }
        }

        let entry = finalize_entry(&request_id, p, content, None);
        self.emit_http(entry).await;
    }

    async fn on_failed(&self, request_id: String, error_text: String) {
        let pending = {
            let mut st = self.state.lock().await;
            st.pending.remove(&request_id)
        };
        let Some(p) = pending else {
            debug!("loadingFailed for unknown request {request_id}");
            return;
        };
        let content = Content {
            size: 0,
            mime_type: p
                .response
                .as_ref()
                .and_then(|r| r.mime_type.clone())
                .unwrap_or_default(),
            text: None,
            encoding: None,
        };
        let entry = finalize_entry(&request_id, p, content, Some(error_text));
        self.emit_http(entry).await;
    }

    async fn on_ws_frame(
        &self,
        request_id: String,
        timestamp: f64,
        frame: tap::TapWsFrame,
        direction: FrameDirection,
    ) {
        let meta = {
            let st = self.state.lock().await;
            st.open_ws
                .get(&request_id)
                .map(|w| (w.url.clone(), w.tab_id))
        };
        // Frames for sockets we never saw open are dropped.
        let Some((url, tab_id)) = meta else {
            debug!("frame for unknown websocket {request_id}");
            return;
        };

        let size = frame.payload_data.len() as i64;
        let mut record = WsFrame {
            envelope: Envelope {
                id: String::new(),
                ts: secs_to_ms(timestamp),
                tab_id,
                hostname: hostname_of(&url),
            },
            connection_id: request_id,
            url,
            direction,
            opcode: frame.opcode,
            data: frame.payload_data,
            size,
        };
        if let Err(e) = self.store.append(&mut record).await {
            warn!("ws frame append failed: {e}");
        }
    }

    async fn on_sse(
        &self,
        tab_id: i64,
        request_id: String,
        timestamp: f64,
        event_name: String,
        event_id: String,
        data: String,
    ) {
        let url = {
            let st = self.state.lock().await;
            st.pending
                .get(&request_id)
                .map(|p| p.url.clone())
                .unwrap_or_default()
        };
        let event_type = if event_name.is_empty() {
            "message".to_string()
        } else {
            event_name
        };
        let mut record = SseEvent {
            envelope: Envelope {
                id: String::new(),
                ts: secs_to_ms(timestamp),
                tab_id,
                hostname: hostname_of(&url),
            },
            url,
            event_type,
            data,
            event_id,
        };
        if let Err(e) = self.store.append(&mut record).await {
            warn!("sse event append failed: {e}");
        }
    }

    async fn emit_http(&self, mut entry: HttpEntry) {
        if let Err(e) = self.store.append(&mut entry).await {
            warn!("http entry append failed: {e}");
        }
    }
}

// ─── Normalization ───────────────────────────────────────────────────────────

fn headers_to_list(headers: &std::collections::BTreeMap<String, String>) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| NameValue::new(name.clone(), value.clone()))
        .collect()
}

fn query_of(url: &str) -> Vec<NameValue> {
    url::Url::parse(url)
        .map(|u| {
            u.query_pairs()
                .map(|(name, value)| NameValue::new(name.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_request(request: &TapRequest) -> HttpRequest {
    let post_data = request.post_data.as_ref().map(|text| PostData {
        mime_type: request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "text/plain".to_string()),
        text: text.clone(),
    });
    HttpRequest {
        method: request.method.clone(),
        url: request.url.clone(),
        http_version: "HTTP/1.1".to_string(),
        headers: headers_to_list(&request.headers),
        query_string: query_of(&request.url),
        cookies: Vec::new(),
        headers_size: -1,
        body_size: post_data.as_ref().map_or(0, |p| p.text.len() as i64),
        post_data,
    }
}

/// Build the entry for a redirect hop superseded by the next
/// `requestWillBeSent`. The redirect target comes from the `Location`
/// header, falling back to the next hop's URL.
fn redirect_hop_entry(
    request_id: &str,
    p: PendingHttp,
    redirect: &TapResponse,
    next_url: &str,
) -> HttpEntry {
    let redirect_url = redirect
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("location"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| next_url.to_string());
    let http_version = redirect
        .protocol
        .clone()
        .unwrap_or_else(|| "HTTP/1.1".to_string());

    HttpEntry {
        envelope: Envelope {
            id: String::new(),
            ts: p.ts,
            tab_id: p.tab_id,
            hostname: hostname_of(&p.url),
        },
        request_id: request_id.to_string(),
        started_at: crate::clip::har::iso_ms(p.ts),
        request: p.request,
        response: HttpResponse {
            status: redirect.status,
            status_text: redirect.status_text.clone(),
            http_version,
            headers: headers_to_list(&redirect.headers),
            cookies: Vec::new(),
            content: Content {
                size: 0,
                mime_type: redirect.mime_type.clone().unwrap_or_default(),
                text: None,
                encoding: None,
            },
            redirect_url,
            headers_size: -1,
            body_size: 0,
            error: None,
        },
        time_ms: p.observed.elapsed().as_millis() as f64,
        resource_type: p.resource_type,
    }
}

/// Build the terminal entry for a finished or failed transaction.
fn finalize_entry(
    request_id: &str,
    p: PendingHttp,
    content: Content,
    error: Option<String>,
) -> HttpEntry {
    let (status, status_text, headers, http_version) = match &p.response {
        Some(r) => (
            r.status,
            r.status_text.clone(),
            headers_to_list(&r.headers),
            r.protocol.clone().unwrap_or_else(|| "HTTP/1.1".to_string()),
        ),
        None => (0, String::new(), Vec::new(), "HTTP/1.1".to_string()),
    };
    let body_size = content.size;

    HttpEntry {
        envelope: Envelope {
            id: String::new(),
            ts: p.ts,
            tab_id: p.tab_id,
            hostname: hostname_of(&p.url),
        },
        request_id: request_id.to_string(),
        started_at: crate::clip::har::iso_ms(p.ts),
        request: p.request,
        response: HttpResponse {
            status,
            status_text,
            http_version,
            headers,
            cookies: Vec::new(),
            content,
            redirect_url: String::new(),
            headers_size: -1,
            body_size,
            error,
        },
        time_ms: p.observed.elapsed().as_millis() as f64,
        resource_type: p.resource_type,
    }
}
