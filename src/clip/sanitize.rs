//! Clip-time sanitization of the built HAR document.
//!
//! Operates on the assembled document only — the store keeps raw captures so
//! pattern changes never require re-capturing. The blocklist is the union of
//! exact header names, built-in substring patterns, and caller-supplied
//! custom substrings; all matching is case-insensitive. Sanitization is
//! idempotent: running it twice yields the same document.

use regex::Regex;
use serde_json::Value;
use url::Url;

use super::har::HarDocument;
use crate::store::NameValue;

const REDACTED: &str = "[REDACTED]";

/// Headers redacted by exact (case-insensitive) name.
const EXACT_HEADERS: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
];

/// Substring patterns applied to header names, query parameter names, and
/// JSON object keys.
const BUILTIN_PATTERNS: [&str; 9] = [
    "token",
    "key",
    "secret",
    "password",
    "credential",
    "auth",
    "session",
    "jwt",
    "bearer",
];

/// Redaction pass over a built HAR document.
pub struct Sanitizer {
    /// Lowercased substring patterns: built-ins plus custom.
    patterns: Vec<String>,
    /// One `(<pattern>[=:]\s*)(<value>)` regex per pattern, for non-JSON bodies.
    body_regexes: Vec<Regex>,
    sanitize_url_params: bool,
}

impl Sanitizer {
    pub fn new(custom_patterns: &[String], sanitize_url_params: bool) -> Self {
        let mut patterns: Vec<String> =
            BUILTIN_PATTERNS.iter().map(|p| (*p).to_string()).collect();
        for custom in custom_patterns {
            let lowered = custom.to_lowercase();
            if !lowered.is_empty() && !patterns.contains(&lowered) {
                patterns.push(lowered);
            }
        }
        let body_regexes = patterns
            .iter()
            .filter_map(|p| {
                Regex::new(&format!(r"(?i)({}[=:]\s*)([^&\s]+)", regex::escape(p))).ok()
            })
            .collect();
        Self {
            patterns,
            body_regexes,
            sanitize_url_params,
        }
    }

    /// Sanitize the document in place.
    pub fn sanitize(&self, doc: &mut HarDocument) {
        for entry in &mut doc.log.entries {
            self.redact_headers(&mut entry.request.headers);
            self.redact_headers(&mut entry.response.headers);
            entry.request.cookies.clear();
            entry.response.cookies.clear();

            if self.sanitize_url_params {
                entry.request.url = self.redact_url(&entry.request.url);
                for param in &mut entry.request.query_string {
                    if self.name_matches_pattern(&param.name) {
                        param.value = REDACTED.to_string();
                    }
                }
            }

            if let Some(post) = &mut entry.request.post_data {
                post.text = self.redact_body(&post.text);
            }
        }

        for msg in &mut doc.log.web_socket_messages {
            if self.sanitize_url_params {
                msg.url = self.redact_url(&msg.url);
            }
            // Only text frames carry redactable payloads.
            if msg.opcode == 1 {
                msg.data = self.redact_json_text(&msg.data);
            }
        }

        for event in &mut doc.log.server_sent_events {
            if self.sanitize_url_params {
                event.url = self.redact_url(&event.url);
            }
            event.data = self.redact_json_text(&event.data);
        }
    }

    fn name_matches_pattern(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.patterns.iter().any(|p| lowered.contains(p.as_str()))
    }

    fn header_matches(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        EXACT_HEADERS.contains(&lowered.as_str()) || self.name_matches_pattern(&lowered)
    }

    fn redact_headers(&self, headers: &mut [NameValue]) {
        for header in headers {
            if self.header_matches(&header.name) {
                header.value = REDACTED.to_string();
            }
        }
    }

    /// Rewrite a URL with matching query parameter values replaced. The
    /// serializer may percent-encode the replacement; both forms are fine.
    fn redact_url(&self, raw: &str) -> String {
        let Ok(mut url) = Url::parse(raw) else {
            return raw.to_string();
        };
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if pairs.is_empty() || !pairs.iter().any(|(k, _)| self.name_matches_pattern(k)) {
            return raw.to_string();
        }
        {
            let mut serializer = url.query_pairs_mut();
            serializer.clear();
            for (k, v) in &pairs {
                if self.name_matches_pattern(k) {
                    serializer.append_pair(k, REDACTED);
                } else {
                    serializer.append_pair(k, v);
                }
            }
        }
        url.to_string()
    }

    /// Request bodies: JSON values get a recursive key walk; anything else
    /// gets the per-pattern `name[=:]value` regex pass.
    fn redact_body(&self, text: &str) -> String {
        if let Ok(mut value) = serde_json::from_str::<Value>(text) {
            self.redact_json_value(&mut value);
            return value.to_string();
        }
        let mut out = text.to_string();
        for re in &self.body_regexes {
            out = re.replace_all(&out, format!("${{1}}{REDACTED}")).into_owned();
        }
        out
    }

    /// WS text frames and SSE data: JSON payloads are walked, everything
    /// else passes through unchanged.
    fn redact_json_text(&self, text: &str) -> String {
        match serde_json::from_str::<Value>(text) {
            Ok(mut value) => {
                self.redact_json_value(&mut value);
                value.to_string()
            }
            Err(_) => text.to_string(),
        }
    }

    fn redact_json_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if self.name_matches_pattern(key) {
                        *val = Value::String(REDACTED.to_string());
                    } else {
                        self.redact_json_value(val);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_json_value(item);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::har::{build, HarWsMessage};
    use crate::clip::Snapshot;
    use crate::store::{Content, Envelope, HttpEntry, HttpRequest, HttpResponse, PostData};

    fn entry_with(url: &str, headers: Vec<NameValue>, post: Option<PostData>) -> HttpEntry {
        HttpEntry {
            envelope: Envelope {
                id: "e1".into(),
                ts: 1000,
                tab_id: 1,
                hostname: "api.example.com".into(),
            },
            request_id: "r1".into(),
            started_at: "1970-01-01T00:00:01.000Z".into(),
            request: HttpRequest {
                method: "GET".into(),
                url: url.to_string(),
                http_version: "HTTP/1.1".into(),
                headers,
                query_string: url::Url::parse(url)
                    .map(|u| {
                        u.query_pairs()
                            .map(|(k, v)| NameValue::new(k.into_owned(), v.into_owned()))
                            .collect()
                    })
                    .unwrap_or_default(),
                cookies: vec![serde_json::json!({"name": "sid", "value": "x"})],
                headers_size: -1,
                body_size: 0,
                post_data: post,
            },
            response: HttpResponse {
                status: 200,
                status_text: "OK".into(),
                http_version: "HTTP/1.1".into(),
                headers: vec![NameValue::new("Set-Cookie", "sid=abc")],
                cookies: vec![serde_json::json!({"name": "sid", "value": "x"})],
                content: Content {
                    size: 500,
                    mime_type: "application/json".into(),
                    text: Some(r#"{"users":[]}"#.into()),
                    encoding: None,
                },
                redirect_url: String::new(),
                headers_size: -1,
                body_size: 500,
                error: None,
            },
            time_ms: 3.0,
            resource_type: "xhr".into(),
        }
    }

    fn doc_with(entry: HttpEntry) -> HarDocument {
        build(
            &Snapshot {
                http: vec![entry],
                ws: vec![],
                sse: vec![],
            },
            None,
        )
    }

    #[test]
    fn redacts_auth_header_and_url_token_keeps_benign_param() {
        let mut doc = doc_with(entry_with(
            "https://api.example.com/users?token=abc&page=1",
            vec![NameValue::new("Authorization", "Bearer x")],
            None,
        ));
        Sanitizer::new(&[], true).sanitize(&mut doc);

        let req = &doc.log.entries[0].request;
        assert!(req.url.contains("token=%5BREDACTED%5D") || req.url.contains("token=[REDACTED]"));
        assert!(req.url.contains("page=1"));
        assert_eq!(req.headers[0].name, "Authorization");
        assert_eq!(req.headers[0].value, "[REDACTED]");
        let token = req.query_string.iter().find(|p| p.name == "token").unwrap();
        assert_eq!(token.value, "[REDACTED]");
        let page = req.query_string.iter().find(|p| p.name == "page").unwrap();
        assert_eq!(page.value, "1");
    }

    #[test]
    fn cookie_lists_always_emptied() {
        let mut doc = doc_with(entry_with("https://api.example.com/a", vec![], None));
        Sanitizer::new(&[], false).sanitize(&mut doc);
        assert!(doc.log.entries[0].request.cookies.is_empty());
        assert!(doc.log.entries[0].response.cookies.is_empty());
        // set-cookie value still redacted through the header pass
        assert_eq!(doc.log.entries[0].response.headers[0].value, "[REDACTED]");
    }

    #[test]
    fn url_params_left_alone_when_disabled() {
        let mut doc = doc_with(entry_with("https://api.example.com/a?token=abc", vec![], None));
        Sanitizer::new(&[], false).sanitize(&mut doc);
        assert!(doc.log.entries[0].request.url.contains("token=abc"));
    }

    #[test]
    fn json_post_body_keys_redacted_recursively() {
        let mut doc = doc_with(entry_with(
            "https://api.example.com/login",
            vec![],
            Some(PostData {
                mime_type: "application/json".into(),
                text: r#"{"user":"ed","password":"hunter2","nested":{"api_key":"k","ok":1}}"#
                    .into(),
            }),
        ));
        Sanitizer::new(&[], true).sanitize(&mut doc);
        let text = doc.log.entries[0].request.post_data.as_ref().unwrap();
        let v: Value = serde_json::from_str(&text.text).unwrap();
        assert_eq!(v["password"], "[REDACTED]");
        assert_eq!(v["nested"]["api_key"], "[REDACTED]");
        assert_eq!(v["nested"]["ok"], 1);
        assert_eq!(v["user"], "ed");
    }

    #[test]
    fn form_encoded_body_uses_regex_fallback() {
        let mut doc = doc_with(entry_with(
            "https://api.example.com/login",
            vec![],
            Some(PostData {
                mime_type: "application/x-www-form-urlencoded".into(),
                text: "user=ed&password=hunter2&next=/home".into(),
            }),
        ));
        Sanitizer::new(&[], true).sanitize(&mut doc);
        let text = &doc.log.entries[0].request.post_data.as_ref().unwrap().text;
        assert!(text.contains("password=[REDACTED]"));
        assert!(text.contains("user=ed"));
        assert!(text.contains("next=/home"));
    }

    #[test]
    fn ws_text_frame_json_redacted_binary_untouched() {
        let frame = |opcode: i64, data: &str| HarWsMessage {
            timestamp: "1970-01-01T00:00:01.000Z".into(),
            tab_id: 1,
            url: "wss://example.com/s".into(),
            connection_id: "c1".into(),
            kind: "send".into(),
            opcode,
            data: data.into(),
            size: data.len() as i64,
        };
        let mut doc = build(
            &Snapshot {
                http: vec![],
                ws: vec![],
                sse: vec![],
            },
            None,
        );
        doc.log.web_socket_messages = vec![
            frame(1, r#"{"auth_token":"s","msg":"hi"}"#),
            frame(2, "AAEC"),
            frame(1, "not json at all"),
        ];
        Sanitizer::new(&[], true).sanitize(&mut doc);

        let v: Value = serde_json::from_str(&doc.log.web_socket_messages[0].data).unwrap();
        assert_eq!(v["auth_token"], "[REDACTED]");
        assert_eq!(v["msg"], "hi");
        assert_eq!(doc.log.web_socket_messages[1].data, "AAEC");
        assert_eq!(doc.log.web_socket_messages[2].data, "not json at all");
    }

    #[test]
    fn sse_data_json_redacted() {
        let mut doc = build(
            &Snapshot {
                http: vec![],
                ws: vec![],
                sse: vec![crate::store::SseEvent {
                    envelope: Envelope {
                        id: "s1".into(),
                        ts: 1000,
                        tab_id: 1,
                        hostname: "example.com".into(),
                    },
                    url: "https://example.com/events".into(),
                    event_type: "update".into(),
                    data: r#"{"session":"abc","n":2}"#.into(),
                    event_id: String::new(),
                }],
            },
            None,
        );
        Sanitizer::new(&[], true).sanitize(&mut doc);
        let v: Value = serde_json::from_str(&doc.log.server_sent_events[0].data).unwrap();
        assert_eq!(v["session"], "[REDACTED]");
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn custom_patterns_extend_the_set() {
        let mut doc = doc_with(entry_with(
            "https://api.example.com/a?fingerprint=xyz",
            vec![NameValue::new("X-Fingerprint", "xyz")],
            None,
        ));
        Sanitizer::new(&["fingerprint".to_string()], true).sanitize(&mut doc);
        let req = &doc.log.entries[0].request;
        assert!(!req.url.contains("xyz"));
        assert_eq!(req.headers[0].value, "[REDACTED]");
    }

    #[test]
    fn exact_header_names_match_case_insensitively() {
        let s = Sanitizer::new(&[], true);
        assert!(s.header_matches("AUTHORIZATION"));
        assert!(s.header_matches("Set-Cookie"));
        assert!(s.header_matches("x-api-key"));
        assert!(s.header_matches("X-Custom-Token"));
        assert!(!s.header_matches("Content-Type"));
        assert!(!s.header_matches("Accept"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut doc = doc_with(entry_with(
            "https://api.example.com/users?token=abc&page=1",
            vec![NameValue::new("Authorization", "Bearer x")],
            Some(PostData {
                mime_type: "application/json".into(),
                text: r#"{"password":"p"}"#.into(),
            }),
        ));
        let sanitizer = Sanitizer::new(&[], true);
        sanitizer.sanitize(&mut doc);
        let once = serde_json::to_string(&doc).unwrap();
        sanitizer.sanitize(&mut doc);
        let twice = serde_json::to_string(&doc).unwrap();
        assert_eq!(once, twice);
    }
}
