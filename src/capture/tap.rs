//! Wire contract for browser taps.
//!
//! A tap streams JSON events over its WebSocket, one object per message,
//! discriminated by a `"type"` field. Timestamps arrive in seconds (the
//! browser's monotonic network clock) and are converted to milliseconds on
//! ingest.
//!
//! ## Event types (tap → engine)
//!
//! | Type                     | Fields                                                        |
//! |--------------------------|---------------------------------------------------------------|
//! | `requestWillBeSent`      | `requestId`, `request{method,url,headers,postData?}`, `timestamp`, `resourceType?`, `redirectResponse?` |
//! | `responseReceived`       | `requestId`, `response{status,statusText,headers,mimeType,protocol,encodedDataLength?,url?}` |
//! | `loadingFinished`        | `requestId`, `encodedDataLength`                              |
//! | `loadingFailed`          | `requestId`, `errorText`                                      |
//! | `webSocketCreated`       | `requestId`, `url`                                            |
//! | `webSocketFrameSent`     | `requestId`, `timestamp`, `frame{opcode,payloadData}`         |
//! | `webSocketFrameReceived` | `requestId`, `timestamp`, `frame{opcode,payloadData}`         |
//! | `webSocketClosed`        | `requestId`                                                   |
//! | `eventSourceMessage`     | `requestId`, `timestamp`, `eventName`, `eventId`, `data`      |
//! | `navigated`              | `url`                                                         |
//! | `responseBody`           | `id`, `body`, `base64Encoded` — reply to `getResponseBody`    |
//!
//! ## Requests (engine → tap)
//!
//! | Type              | Fields             |
//! |-------------------|--------------------|
//! | `getResponseBody` | `id`, `requestId`  |

use std::collections::BTreeMap;

use serde::Deserialize;

/// Request half of a `requestWillBeSent` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
}

/// Response description — used by both `responseReceived` and the
/// `redirectResponse` attached to the next hop's `requestWillBeSent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapResponse {
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub encoded_data_length: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A WebSocket frame payload as the tap delivers it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapWsFrame {
    pub opcode: i64,
    pub payload_data: String,
}

/// One tap message, discriminated by `"type"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TapEvent {
    #[serde(rename_all = "camelCase")]
    RequestWillBeSent {
        request_id: String,
        request: TapRequest,
        /// Seconds.
        timestamp: f64,
        #[serde(default)]
        resource_type: Option<String>,
        #[serde(default)]
        redirect_response: Option<TapResponse>,
    },
    #[serde(rename_all = "camelCase")]
    ResponseReceived {
        request_id: String,
        response: TapResponse,
    },
    #[serde(rename_all = "camelCase")]
    LoadingFinished {
        request_id: String,
        encoded_data_length: f64,
    },
    #[serde(rename_all = "camelCase")]
    LoadingFailed {
        request_id: String,
        error_text: String,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketCreated { request_id: String, url: String },
    #[serde(rename_all = "camelCase")]
    WebSocketFrameSent {
        request_id: String,
        timestamp: f64,
        frame: TapWsFrame,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketFrameReceived {
        request_id: String,
        timestamp: f64,
        frame: TapWsFrame,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketClosed { request_id: String },
    #[serde(rename_all = "camelCase")]
    EventSourceMessage {
        request_id: String,
        timestamp: f64,
        #[serde(default)]
        event_name: String,
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Navigated { url: String },
    /// Reply to a `getResponseBody` request; handled by the tap transport,
    /// never forwarded to the pipeline.
    #[serde(rename_all = "camelCase")]
    ResponseBody {
        id: u64,
        #[serde(default)]
        body: String,
        #[serde(default)]
        base64_encoded: bool,
    },
}

/// A retrieved response body.
#[derive(Debug, Clone)]
pub struct TapBody {
    pub body: String,
    pub base64_encoded: bool,
}

/// Issues body-retrieval calls back to the tap that produced an event.
///
/// The WS transport implements this with a correlation map; tests use an
/// in-memory fake. Failures are strings — the pipeline logs them and emits
/// the entry without a body.
#[allow(async_fn_in_trait)]
pub trait BodyProvider {
    async fn fetch_body(&self, request_id: &str) -> Result<TapBody, String>;
}

/// A provider that always fails. Used where no tap is reachable.
pub struct NoBody;

impl BodyProvider for NoBody {
    async fn fetch_body(&self, _request_id: &str) -> Result<TapBody, String> {
        Err("no tap channel".to_string())
    }
}

/// Convert a tap timestamp (seconds) to envelope milliseconds.
pub fn secs_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_will_be_sent() {
        let raw = r#"{
            "type": "requestWillBeSent",
            "requestId": "req-1",
            "request": {
                "method": "GET",
                "url": "https://api.example.com/users?page=1",
                "headers": {"Accept": "application/json"}
            },
            "timestamp": 1234.567,
            "resourceType": "xhr"
        }"#;
        let ev: TapEvent = serde_json::from_str(raw).unwrap();
        match ev {
            TapEvent::RequestWillBeSent {
                request_id,
                request,
                timestamp,
                resource_type,
                redirect_response,
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(request.method, "GET");
                assert_eq!(resource_type.as_deref(), Some("xhr"));
                assert!(redirect_response.is_none());
                assert_eq!(secs_to_ms(timestamp), 1_234_567);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_redirect_response() {
        let raw = r#"{
            "type": "requestWillBeSent",
            "requestId": "req-1",
            "request": {"method": "GET", "url": "https://example.com/new"},
            "timestamp": 2.0,
            "redirectResponse": {
                "status": 301,
                "statusText": "Moved Permanently",
                "headers": {"Location": "https://example.com/new"}
            }
        }"#;
        let ev: TapEvent = serde_json::from_str(raw).unwrap();
        match ev {
            TapEvent::RequestWillBeSent {
                redirect_response: Some(r),
                ..
            } => {
                assert_eq!(r.status, 301);
                assert_eq!(
                    r.headers.get("Location").map(String::as_str),
                    Some("https://example.com/new")
                );
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_ws_frame_and_body_reply() {
        let raw = r#"{
            "type": "webSocketFrameSent",
            "requestId": "ws-1",
            "timestamp": 3.5,
            "frame": {"opcode": 1, "payloadData": "{\"msg\":\"hi\"}"}
        }"#;
        let ev: TapEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(ev, TapEvent::WebSocketFrameSent { .. }));

        let raw = r#"{"type": "responseBody", "id": 7, "body": "aGk=", "base64Encoded": true}"#;
        let ev: TapEvent = serde_json::from_str(raw).unwrap();
        match ev {
            TapEvent::ResponseBody {
                id,
                body,
                base64_encoded,
            } => {
                assert_eq!(id, 7);
                assert_eq!(body, "aGk=");
                assert!(base64_encoded);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn seconds_convert_to_millis() {
        assert_eq!(secs_to_ms(0.001), 1);
        assert_eq!(secs_to_ms(1.0), 1000);
    }
}
