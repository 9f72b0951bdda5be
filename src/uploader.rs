//! HTTPS client for the remote clip store.
//!
//! [`RemoteStore`] wraps `reqwest::Client` for the two remote surfaces:
//! `POST /rest/v1/clips` (clip rows) and
//! `POST /storage/v1/object/<bucket>/<filename>` (oversized HAR blobs).
//! Every request carries `apikey` and `Authorization: Bearer` headers; row
//! writes add `Prefer: return=representation` and blob writes add
//! `x-upsert: true`.
//!
//! ## Error handling
//!
//! Non-2xx responses surface the status code and the response body verbatim
//! — the control plane forwards both to the caller.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a single remote request may take before failing normally.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tab filter recorded with a clip row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TabFilter {
    All,
    Tabs { tabs: Vec<i64> },
}

/// One clip row as the remote store receives it. Exactly one of `har_data`
/// and `storage_path` is non-null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_name: Option<String>,
    pub time_range_start: String,
    pub time_range_end: String,
    pub duration_seconds: i64,
    pub tab_filter: TabFilter,
    pub entry_count: u64,
    pub total_size_bytes: u64,
    pub har_data: Option<serde_json::Value>,
    pub storage_path: Option<String>,
}

/// Remote store failures.
#[derive(Debug)]
pub enum UploadError {
    /// Transport failure (connection refused, timeout, DNS, TLS).
    Request(reqwest::Error),
    /// The remote returned a non-2xx status; body preserved verbatim.
    Remote { status: u16, body: String },
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Request(e) => write!(f, "remote request failed: {e}"),
            UploadError::Remote { status, body } => {
                write!(f, "remote store error (HTTP {status}): {body}")
            }
        }
    }
}

impl std::error::Error for UploadError {}

/// Stateless HTTPS client for one remote endpoint.
pub struct RemoteStore {
    http: reqwest::Client,
    endpoint: String,
    key: String,
    bucket: String,
}

impl RemoteStore {
    pub fn new(endpoint: &str, key: &str, bucket: &str) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(UploadError::Request)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
            bucket: bucket.to_string(),
        })
    }

    /// `POST /rest/v1/clips` — insert one clip row. Returns the
    /// representation echoed by the remote (an array containing the row).
    pub async fn insert_clip_row(&self, row: &ClipRow) -> Result<serde_json::Value, UploadError> {
        let resp = self
            .http
            .post(format!("{}/rest/v1/clips", self.endpoint))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .map_err(UploadError::Request)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(UploadError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null))
    }

    /// `POST /storage/v1/object/<bucket>/<filename>` — upload serialized HAR bytes.
    pub async fn upload_blob(&self, filename: &str, bytes: Vec<u8>) -> Result<(), UploadError> {
        let resp = self
            .http
            .post(format!(
                "{}/storage/v1/object/{}/{filename}",
                self.endpoint, self.bucket
            ))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("x-upsert", "true")
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(UploadError::Request)?;
        Self::check(resp).await
    }

    /// Probe an endpoint/key pair by selecting from the clips table.
    pub async fn test_connection(endpoint: &str, key: &str) -> Result<(), UploadError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(UploadError::Request)?;
        let endpoint = endpoint.trim_end_matches('/');
        let resp = http
            .get(format!("{endpoint}/rest/v1/clips?select=id&limit=1"))
            .header("apikey", key)
            .bearer_auth(key)
            .send()
            .await
            .map_err(UploadError::Request)?;
        Self::check(resp).await
    }

    async fn check(resp: reqwest::Response) -> Result<(), UploadError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(UploadError::Remote {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_filter_serializes_to_tagged_shape() {
        assert_eq!(
            serde_json::to_value(&TabFilter::All).unwrap(),
            serde_json::json!({"type": "all"})
        );
        assert_eq!(
            serde_json::to_value(&TabFilter::Tabs { tabs: vec![3, 9] }).unwrap(),
            serde_json::json!({"type": "tabs", "tabs": [3, 9]})
        );
    }

    #[test]
    fn clip_row_nulls_exactly_one_payload_field() {
        let row = ClipRow {
            clip_name: None,
            time_range_start: "1970-01-01T00:00:00.000Z".into(),
            time_range_end: "1970-01-01T00:00:02.000Z".into(),
            duration_seconds: 2,
            tab_filter: TabFilter::All,
            entry_count: 1,
            total_size_bytes: 1234,
            har_data: None,
            storage_path: Some("clip-1970-01-01T00-00-02-000Z.json".into()),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert!(v["har_data"].is_null());
        assert_eq!(v["storage_path"], "clip-1970-01-01T00-00-02-000Z.json");
        // clip_name omitted entirely when unnamed
        assert!(v.get("clip_name").is_none());
    }

    #[test]
    fn remote_error_preserves_status_and_body() {
        let e = UploadError::Remote {
            status: 403,
            body: "{\"message\":\"permission denied\"}".into(),
        };
        let text = e.to_string();
        assert!(text.contains("403"));
        assert!(text.contains("permission denied"));
    }
}
