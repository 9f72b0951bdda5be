//! Buffer manager — enforces the rolling buffer's two invariants.
//!
//! A pass runs every five minutes and on demand: (1) no record older than
//! 24 hours survives, (2) on-disk usage stays under the configured cap.
//! Cap enforcement evicts the oldest records using a coarse 2000-byte
//! per-record estimate; convergence may take more than one pass, which is
//! fine — the next pass continues evicting.
//!
//! Passes are re-entrancy guarded: a trigger while a pass is running
//! coalesces into at most one queued follow-up. Failures are logged, never
//! reported — the next pass retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SettingsHandle;
use crate::store::{now_ms, Store, Stream};

/// Age horizon of the rolling buffer.
pub const MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Eviction aims for this fraction of the cap.
const EVICTION_TARGET_RATIO: f64 = 0.9;

/// Coarse per-record byte estimate for cap eviction.
const BYTES_PER_RECORD_ESTIMATE: f64 = 2000.0;

const WARNING_RATIO: f64 = 0.8;
const CRITICAL_RATIO: f64 = 0.95;

/// How many oldest records each stream loses when `usage` exceeds `cap`.
pub fn per_stream_eviction(usage: u64, cap: u64) -> usize {
    if usage <= cap {
        return 0;
    }
    let target = cap as f64 * EVICTION_TARGET_RATIO;
    let to_evict = usage as f64 - target;
    ((to_evict / BYTES_PER_RECORD_ESTIMATE) / 3.0).ceil() as usize
}

/// Storage pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal,
    Warning,
    Critical,
}

/// Classify `usage` against `cap` (thresholds at 80% and 95%).
pub fn pressure_of(usage: u64, cap: u64) -> Pressure {
    let ratio = usage as f64 / cap as f64;
    if ratio >= CRITICAL_RATIO {
        Pressure::Critical
    } else if ratio >= WARNING_RATIO {
        Pressure::Warning
    } else {
        Pressure::Normal
    }
}

/// Oldest/newest record timestamps across all streams.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferSpan {
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
    pub duration_ms: i64,
}

/// Usage-side status for the control plane.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageStatus {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub cap_bytes: u64,
    pub pressure: Pressure,
    /// True when the cap, not the age horizon, is limiting retention.
    pub truncated: bool,
}

/// Enforces age expiry and the byte cap on the store.
pub struct BufferManager {
    store: Arc<Store>,
    settings: SettingsHandle,
    pass_lock: Mutex<()>,
    queued: AtomicBool,
}

impl BufferManager {
    pub fn new(store: Arc<Store>, settings: SettingsHandle) -> Self {
        Self {
            store,
            settings,
            pass_lock: Mutex::new(()),
            queued: AtomicBool::new(false),
        }
    }

    /// Run a cleanup pass now. A trigger while a pass is in flight queues at
    /// most one follow-up and returns immediately.
    pub async fn run(&self) {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            self.queued.store(true, Ordering::Relaxed);
            return;
        };
        loop {
            self.pass().await;
            if !self.queued.swap(false, Ordering::Relaxed) {
                break;
            }
        }
    }

    async fn pass(&self) {
        let t_cut = now_ms() - MAX_AGE_MS;
        for stream in Stream::ALL {
            match self.store.delete_older_than(stream, t_cut).await {
                Ok(0) => {}
                Ok(n) => debug!("expired {n} {} records past the age horizon", stream.as_str()),
                Err(e) => warn!("age expiry failed for {}: {e}", stream.as_str()),
            }
        }

        let usage = match self.store.estimate_usage().await {
            Ok((usage, _)) => usage,
            Err(e) => {
                warn!("usage estimate failed: {e}");
                return;
            }
        };
        let cap = self.settings.get().storage_cap_class.bytes();

        if usage > cap {
            let per_stream = per_stream_eviction(usage, cap);
            info!("usage {usage} B over cap {cap} B, evicting {per_stream} records per stream");
            for stream in Stream::ALL {
                if let Err(e) = self.store.delete_oldest(stream, per_stream).await {
                    warn!("cap eviction failed for {}: {e}", stream.as_str());
                }
            }
        }

        if let Err(e) = self.store.put_meta("last-cleanup", &now_ms()).await {
            warn!("failed to record last-cleanup: {e}");
        }
        if let Err(e) = self.store.put_meta("last-usage-bytes", &usage).await {
            warn!("failed to record last-usage-bytes: {e}");
        }
    }

    /// Oldest and newest record timestamps across the three streams.
    pub async fn span(&self) -> BufferSpan {
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;
        for stream in Stream::ALL {
            match self.store.extremes(stream).await {
                Ok((min_ts, max_ts)) => {
                    oldest = match (oldest, min_ts) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    newest = match (newest, max_ts) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
                }
                Err(e) => warn!("extremes failed for {}: {e}", stream.as_str()),
            }
        }
        let duration_ms = match (oldest, newest) {
            (Some(o), Some(n)) => (n - o).max(0),
            _ => 0,
        };
        BufferSpan {
            oldest_ts: oldest,
            newest_ts: newest,
            duration_ms,
        }
    }

    /// Usage, pressure, and truncation status for the control plane.
    pub async fn usage_status(&self) -> UsageStatus {
        let (usage_bytes, quota_bytes) = self.store.estimate_usage().await.unwrap_or((0, 0));
        let cap_bytes = self.settings.get().storage_cap_class.bytes();
        let span = self.span().await;
        let pressure = pressure_of(usage_bytes, cap_bytes);
        let truncated = span.duration_ms < MAX_AGE_MS
            && usage_bytes as f64 > cap_bytes as f64 * WARNING_RATIO;
        UsageStatus {
            usage_bytes,
            quota_bytes,
            cap_bytes,
            pressure,
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::{Envelope, FrameDirection, WsFrame};

    fn frame(id: &str, ts: i64) -> WsFrame {
        WsFrame {
            envelope: Envelope {
                id: id.to_string(),
                ts,
                tab_id: 1,
                hostname: "example.com".into(),
            },
            connection_id: "c1".into(),
            url: "wss://example.com/s".into(),
            direction: FrameDirection::Send,
            opcode: 1,
            data: "x".into(),
            size: 1,
        }
    }

    #[test]
    fn eviction_count_matches_estimate_arithmetic() {
        // 150 MiB usage against a 100 MiB cap: evict down to 90 MiB at
        // 2000 B/record across three streams.
        let usage = 150 * 1024 * 1024;
        let cap = 100 * 1024 * 1024;
        assert_eq!(per_stream_eviction(usage, cap), 10486);
    }

    #[test]
    fn no_eviction_at_or_under_cap() {
        assert_eq!(per_stream_eviction(100, 100), 0);
        assert_eq!(per_stream_eviction(50, 100), 0);
    }

    #[test]
    fn pressure_thresholds() {
        let cap = 1000;
        assert_eq!(pressure_of(799, cap), Pressure::Normal);
        assert_eq!(pressure_of(800, cap), Pressure::Warning);
        assert_eq!(pressure_of(949, cap), Pressure::Warning);
        assert_eq!(pressure_of(950, cap), Pressure::Critical);
    }

    #[tokio::test]
    async fn pass_expires_records_past_the_age_horizon() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old_ts = now_ms() - 25 * 60 * 60 * 1000;
        store.append(&mut frame("old", old_ts)).await.unwrap();
        store.append(&mut frame("new", now_ms())).await.unwrap();

        let manager = BufferManager::new(
            Arc::clone(&store),
            SettingsHandle::for_tests(Settings::default()),
        );
        manager.run().await;

        assert_eq!(store.count(Stream::Ws).await.unwrap(), 1);
        let last_cleanup: Option<i64> = store.get_meta("last-cleanup").await.unwrap();
        assert!(last_cleanup.is_some());
        let last_usage: Option<u64> = store.get_meta("last-usage-bytes").await.unwrap();
        assert!(last_usage.is_some());
    }

    #[tokio::test]
    async fn empty_store_passes_cleanly() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = BufferManager::new(
            Arc::clone(&store),
            SettingsHandle::for_tests(Settings::default()),
        );
        manager.run().await;
        let span = manager.span().await;
        assert_eq!(span.oldest_ts, None);
        assert_eq!(span.duration_ms, 0);
    }

    #[tokio::test]
    async fn span_covers_all_streams() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let base = now_ms();
        store.append(&mut frame("a", base - 5000)).await.unwrap();
        let mut sse = crate::store::SseEvent {
            envelope: Envelope {
                id: "s".into(),
                ts: base - 1000,
                tab_id: 1,
                hostname: "example.com".into(),
            },
            url: "https://example.com/e".into(),
            event_type: "message".into(),
            data: "d".into(),
            event_id: String::new(),
        };
        store.append(&mut sse).await.unwrap();

        let manager =
            BufferManager::new(store, SettingsHandle::for_tests(Settings::default()));
        let span = manager.span().await;
        assert_eq!(span.oldest_ts, Some(base - 5000));
        assert_eq!(span.newest_ts, Some(base - 1000));
        assert_eq!(span.duration_ms, 4000);
    }
}
