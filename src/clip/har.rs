//! Extended HAR document assembly.
//!
//! The document is HAR 1.2 plus three extensions: per-entry `_tabId`,
//! `_hostname` and `_resourceType` fields, and two sibling arrays
//! `_webSocketMessages` and `_serverSentEvents`. Entries are sorted
//! ascending by timestamp with ties kept in snapshot insertion order, and
//! pages are derived one-per-unique-hostname from the first entry seen for
//! that host.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::{HttpRequest, HttpResponse};

use super::Snapshot;

/// Milliseconds-since-epoch to ISO-8601 with millisecond precision (UTC).
pub fn iso_ms(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarDocument {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub browser: HarBrowser,
    pub pages: Vec<HarPage>,
    pub entries: Vec<HarEntry>,
    #[serde(rename = "_webSocketMessages")]
    pub web_socket_messages: Vec<HarWsMessage>,
    #[serde(rename = "_serverSentEvents")]
    pub server_sent_events: Vec<HarSseEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarBrowser {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPage {
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    pub page_timings: HarPageTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPageTimings {
    pub on_content_load: i64,
    pub on_load: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarTimings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub ssl: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub time: f64,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub cache: serde_json::Value,
    pub timings: HarTimings,
    #[serde(rename = "_tabId")]
    pub tab_id: i64,
    #[serde(rename = "_hostname")]
    pub hostname: String,
    #[serde(rename = "_resourceType")]
    pub resource_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarWsMessage {
    pub timestamp: String,
    pub tab_id: i64,
    pub url: String,
    pub connection_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub opcode: i64,
    pub data: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarSseEvent {
    pub timestamp: String,
    pub tab_id: i64,
    pub url: String,
    pub event: String,
    pub data: String,
    pub id: String,
}

/// Assemble the extended HAR document from one snapshot.
///
/// `browser` is `(name, major_version)` when the tap reported one.
pub fn build(snapshot: &Snapshot, browser: Option<(String, String)>) -> HarDocument {
    let mut http = snapshot.http.clone();
    http.sort_by_key(|e| e.envelope.ts);

    let mut pages: Vec<HarPage> = Vec::new();
    for entry in &http {
        let host = &entry.envelope.hostname;
        if host.is_empty() || pages.iter().any(|p| &p.id == host) {
            continue;
        }
        pages.push(HarPage {
            started_date_time: entry.started_at.clone(),
            id: host.clone(),
            title: host.clone(),
            page_timings: HarPageTimings {
                on_content_load: -1,
                on_load: -1,
            },
        });
    }

    let entries: Vec<HarEntry> = http
        .into_iter()
        .map(|e| HarEntry {
            started_date_time: e.started_at,
            time: e.time_ms,
            request: e.request,
            response: e.response,
            cache: json!({}),
            timings: HarTimings {
                blocked: -1.0,
                dns: -1.0,
                connect: -1.0,
                ssl: -1.0,
                send: 0.0,
                wait: e.time_ms,
                receive: 0.0,
            },
            tab_id: e.envelope.tab_id,
            hostname: e.envelope.hostname,
            resource_type: e.resource_type,
        })
        .collect();

    let mut ws = snapshot.ws.clone();
    ws.sort_by_key(|f| f.envelope.ts);
    let web_socket_messages: Vec<HarWsMessage> = ws
        .into_iter()
        .map(|f| HarWsMessage {
            timestamp: iso_ms(f.envelope.ts),
            tab_id: f.envelope.tab_id,
            url: f.url,
            connection_id: f.connection_id,
            kind: f.direction.as_str().to_string(),
            opcode: f.opcode,
            data: f.data,
            size: f.size,
        })
        .collect();

    let mut sse = snapshot.sse.clone();
    sse.sort_by_key(|e| e.envelope.ts);
    let server_sent_events: Vec<HarSseEvent> = sse
        .into_iter()
        .map(|e| HarSseEvent {
            timestamp: iso_ms(e.envelope.ts),
            tab_id: e.envelope.tab_id,
            url: e.url,
            event: e.event_type,
            data: e.data,
            id: e.event_id,
        })
        .collect();

    let (browser_name, browser_version) =
        browser.unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));

    HarDocument {
        log: HarLog {
            version: "1.2".to_string(),
            creator: HarCreator {
                name: "Browser Clip".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            browser: HarBrowser {
                name: browser_name,
                version: browser_version,
            },
            pages,
            entries,
            web_socket_messages,
            server_sent_events,
        },
    }
}
