//! Record types for the three capture streams.
//!
//! Every record carries the same envelope (id, timestamp, tab, hostname) plus
//! a stream-specific payload. HTTP entries are stored in HAR field naming
//! (camelCase, `redirectURL`, `postData.mimeType`, …) so clip assembly can
//! embed them into the HAR document without a second mapping pass.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The three capture streams plus the metadata keyspace they share a store with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Http,
    Ws,
    Sse,
}

impl Stream {
    /// All streams, in the order the buffer manager sweeps them.
    pub const ALL: [Stream; 3] = [Stream::Http, Stream::Ws, Stream::Sse];

    /// SQLite table backing this stream.
    pub fn table(self) -> &'static str {
        match self {
            Self::Http => "http_entries",
            Self::Ws => "ws_frames",
            Self::Sse => "sse_events",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
            Self::Sse => "sse",
        }
    }
}

/// Common envelope shared by all stream records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable record identifier, unique within the stream.
    pub id: String,
    /// Wall-clock timestamp in milliseconds since epoch.
    pub ts: i64,
    /// Originating browser tab.
    pub tab_id: i64,
    /// Hostname extracted from the record's URL (empty when unparseable).
    pub hostname: String,
}

/// A record that belongs to one of the three streams.
///
/// The store is generic over this trait instead of a sum type: each stream
/// has its own table and its own shape, and cross-stream ordering is
/// recovered at clip time via the timestamp sort.
pub trait StreamRecord: Serialize + DeserializeOwned {
    const STREAM: Stream;

    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;
}

/// One name/value pair — used for both headers and query parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request body payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
}

/// HAR-shaped request half of an HTTP entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    /// Always empty — cookies are never persisted (see the clip sanitizer).
    pub cookies: Vec<serde_json::Value>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

/// Response body content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    /// Present only when the body was retrieved (encoded size ≤ 5 MiB).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `"base64"` when the tap delivered the body base64-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// HAR-shaped response half of an HTTP entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub cookies: Vec<serde_json::Value>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    /// Set when the transaction terminated via loading_failed.
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One completed (or failed) HTTP transaction.
///
/// Created only on transaction termination and never mutated afterward.
/// Redirect chains produce one entry per hop, all sharing the request id
/// through the envelope's `id` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEntry {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Browser request id — shared by all hops of a redirect chain, unlike
    /// the envelope id.
    pub request_id: String,
    /// ISO-8601 start time, mirrors HAR `startedDateTime`.
    pub started_at: String,
    pub request: HttpRequest,
    pub response: HttpResponse,
    /// Elapsed wall-clock milliseconds from first observation to terminal event.
    pub time_ms: f64,
    pub resource_type: String,
}

impl StreamRecord for HttpEntry {
    const STREAM: Stream = Stream::Http;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }
    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

/// Direction of a WebSocket frame relative to the browser.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Send,
    Receive,
}

impl FrameDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

/// One captured WebSocket frame.
///
/// Frames share `connection_id` with the HTTP upgrade request that opened
/// the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub connection_id: String,
    pub url: String,
    pub direction: FrameDirection,
    pub opcode: i64,
    /// Frame payload — text for opcode 1, base64 for binary frames.
    pub data: String,
    pub size: i64,
}

impl StreamRecord for WsFrame {
    const STREAM: Stream = Stream::Ws;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }
    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

/// One captured Server-Sent Event message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub url: String,
    /// Event type; `"message"` when the stream did not name one.
    pub event_type: String,
    pub data: String,
    /// Last-event-id, possibly empty.
    pub event_id: String,
}

impl StreamRecord for SseEvent {
    const STREAM: Stream = Stream::Sse;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }
    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

/// Extract the hostname from a URL, or empty string when unparseable.
pub fn hostname_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_from_https_url() {
        assert_eq!(hostname_of("https://api.example.com/users?a=1"), "api.example.com");
    }

    #[test]
    fn hostname_from_garbage_is_empty() {
        assert_eq!(hostname_of("not a url"), "");
    }

    #[test]
    fn http_entry_uses_har_field_names() {
        let entry = HttpEntry {
            envelope: Envelope {
                id: "r1".into(),
                ts: 1000,
                tab_id: 7,
                hostname: "example.com".into(),
            },
            request_id: "req-1".into(),
            started_at: "2026-01-01T00:00:00.000Z".into(),
            request: HttpRequest {
                method: "GET".into(),
                url: "https://example.com/".into(),
                http_version: "HTTP/1.1".into(),
                headers: vec![],
                query_string: vec![],
                cookies: vec![],
                headers_size: -1,
                body_size: 0,
                post_data: None,
            },
            response: HttpResponse {
                status: 301,
                status_text: "Moved Permanently".into(),
                http_version: "HTTP/1.1".into(),
                headers: vec![],
                cookies: vec![],
                content: Content {
                    size: 0,
                    mime_type: String::new(),
                    text: None,
                    encoding: None,
                },
                redirect_url: "https://example.com/new".into(),
                headers_size: -1,
                body_size: 0,
                error: None,
            },
            time_ms: 12.0,
            resource_type: "document".into(),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["response"]["redirectURL"], "https://example.com/new");
        assert_eq!(v["request"]["httpVersion"], "HTTP/1.1");
        // omitted body must not serialize an explicit null
        assert!(v["response"]["content"].get("text").is_none());
    }
}
