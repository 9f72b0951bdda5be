//! Configuration loading and runtime settings.
//!
//! Two layers:
//!
//! 1. **Static config** — read once at startup, precedence (highest wins):
//!    environment variables (`CLIPD_API_KEY`, `CLIPD_LISTEN`,
//!    `CLIPD_ENDPOINT_URL`, `CLIPD_ENDPOINT_KEY`), then the TOML file
//!    (`--config <path>` or `clipd.toml` in CWD), then compiled defaults.
//! 2. **Runtime settings** — mutable from the control plane, held in a
//!    `tokio::sync::watch` channel so the capture pipeline and buffer
//!    manager observe changes, persisted to `<data_dir>/settings.json`.
//!    The `paused` flag is additionally mirrored into store metadata,
//!    which wins on startup.
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7733"
//! data_dir = "/var/lib/clipd"
//! max_connections = 64
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [remote]
//! endpoint_url = "https://project.supabase.co"
//! endpoint_key = "service-role-key"
//! bucket = "clips"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Top-level static configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and storage-location settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7733`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for the capture database and settings file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Maximum concurrent HTTP connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `CLIPD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Remote object-store seed values. These only seed the runtime settings on
/// first boot; afterwards the persisted settings file wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    pub endpoint_url: Option<String>,
    pub endpoint_key: Option<String>,
    /// Storage bucket for oversized clips (default `clips`).
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:7733".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/clipd".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_bucket() -> String {
    "clips".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `clipd.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("clipd.toml").exists() {
            let content =
                std::fs::read_to_string("clipd.toml").expect("Failed to read clipd.toml");
            toml::from_str(&content).expect("Failed to parse clipd.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                remote: RemoteConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("CLIPD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("CLIPD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("CLIPD_ENDPOINT_URL") {
            config.remote.endpoint_url = Some(url);
        }
        if let Ok(key) = std::env::var("CLIPD_ENDPOINT_KEY") {
            config.remote.endpoint_key = Some(key);
        }

        config
    }
}

// ─── Runtime settings ────────────────────────────────────────────────────────

/// Storage cap classes for the rolling buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapClass {
    #[serde(rename = "100MB")]
    Mb100,
    #[serde(rename = "250MB")]
    Mb250,
    #[serde(rename = "500MB")]
    Mb500,
    #[serde(rename = "1GB")]
    Gb1,
    #[serde(rename = "2GB")]
    Gb2,
}

impl CapClass {
    /// Byte value of the cap.
    pub fn bytes(self) -> u64 {
        const MIB: u64 = 1024 * 1024;
        match self {
            Self::Mb100 => 100 * MIB,
            Self::Mb250 => 250 * MIB,
            Self::Mb500 => 500 * MIB,
            Self::Gb1 => 1024 * MIB,
            Self::Gb2 => 2048 * MIB,
        }
    }
}

/// Default tab scope offered to clip clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipScope {
    CurrentTab,
    SelectTabs,
    AllTabs,
}

/// Runtime-mutable settings, observed reactively via a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// When true, capture is halted and all taps are detached.
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_cap_class")]
    pub storage_cap_class: CapClass,
    #[serde(default = "default_scope")]
    pub default_scope: ClipScope,
    #[serde(default = "default_true")]
    pub sanitize_url_params: bool,
    /// Caller-supplied substrings added to the sanitizer pattern set.
    #[serde(default)]
    pub custom_header_patterns: Vec<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub endpoint_key: Option<String>,
}

fn default_cap_class() -> CapClass {
    CapClass::Mb500
}
fn default_scope() -> ClipScope {
    ClipScope::CurrentTab
}
fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paused: false,
            storage_cap_class: default_cap_class(),
            default_scope: default_scope(),
            sanitize_url_params: true,
            custom_header_patterns: Vec::new(),
            endpoint_url: None,
            endpoint_key: None,
        }
    }
}

/// Shared handle to the runtime settings.
///
/// Cloning is cheap; all clones observe the same watch channel. Updates
/// persist to disk before broadcasting.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: std::sync::Arc<watch::Sender<Settings>>,
    path: PathBuf,
}

impl SettingsHandle {
    /// Load persisted settings from `<data_dir>/settings.json`, seeding the
    /// remote endpoint from the static config on first boot.
    pub fn load(data_dir: &Path, remote: &RemoteConfig) -> Self {
        let path = data_dir.join("settings.json");
        let mut settings = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Settings>(&text).ok())
            .unwrap_or_default();
        if settings.endpoint_url.is_none() {
            settings.endpoint_url = remote.endpoint_url.clone();
        }
        if settings.endpoint_key.is_none() {
            settings.endpoint_key = remote.endpoint_key.clone();
        }
        let (tx, _) = watch::channel(settings);
        Self {
            tx: std::sync::Arc::new(tx),
            path,
        }
    }

    /// In-memory handle for tests.
    pub fn for_tests(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings);
        Self {
            tx: std::sync::Arc::new(tx),
            path: std::env::temp_dir().join("clipd-test-settings.json"),
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Apply a mutation, persist, and notify observers. The broadcast is
    /// suppressed when the mutation changed nothing.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) -> Settings {
        let mut next = self.tx.borrow().clone();
        mutate(&mut next);
        if next != *self.tx.borrow() {
            self.persist(&next);
            self.tx.send_replace(next.clone());
        }
        next
    }

    /// Subscribe to settings changes.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    fn persist(&self, settings: &Settings) {
        match serde_json::to_string_pretty(settings) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("Failed to persist settings to {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("Failed to serialize settings: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7733");
        assert_eq!(config.auth.api_key, "change-me");
        assert_eq!(config.remote.bucket, "clips");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [remote]
            endpoint_url = "https://x.supabase.co"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(
            config.remote.endpoint_url.as_deref(),
            Some("https://x.supabase.co")
        );
        assert_eq!(config.remote.bucket, "clips");
    }

    #[test]
    fn cap_class_bytes() {
        assert_eq!(CapClass::Mb100.bytes(), 100 * 1024 * 1024);
        assert_eq!(CapClass::Mb500.bytes(), 500 * 1024 * 1024);
        assert_eq!(CapClass::Gb2.bytes(), 2048 * 1024 * 1024);
    }

    #[test]
    fn cap_class_serde_names() {
        assert_eq!(
            serde_json::to_string(&CapClass::Mb500).unwrap(),
            "\"500MB\""
        );
        let c: CapClass = serde_json::from_str("\"1GB\"").unwrap();
        assert_eq!(c, CapClass::Gb1);
    }

    #[test]
    fn settings_default_shape() {
        let s = Settings::default();
        assert!(!s.paused);
        assert_eq!(s.storage_cap_class, CapClass::Mb500);
        assert_eq!(s.default_scope, ClipScope::CurrentTab);
        assert!(s.sanitize_url_params);
        assert!(s.custom_header_patterns.is_empty());
    }

    #[test]
    fn scope_serde_is_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ClipScope::CurrentTab).unwrap(),
            "\"current-tab\""
        );
    }

    #[tokio::test]
    async fn settings_updates_notify_subscribers() {
        let handle = SettingsHandle::for_tests(Settings::default());
        let mut rx = handle.subscribe();
        handle.update(|s| s.paused = true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().paused);
    }
}
