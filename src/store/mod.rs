//! Durable, time-indexed storage for the three capture streams.
//!
//! One SQLite database (WAL mode) holds one table per stream plus a small
//! metadata keyspace. Each table carries the record envelope as indexed
//! columns (`ts`, `hostname`, `tab_id`) and the full record as a JSON body
//! column; the `ts` index plus rowid order is the scan path.
//!
//! Every public operation is a single SQLite transaction: a crash mid-call
//! leaves the database in the state immediately before or after. The
//! connection sits behind an async mutex, so overlapping callers serialize
//! per operation and a scan observes a consistent snapshot.

pub mod records;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tokio::sync::Mutex;
#[cfg(unix)]
use tracing::debug;

pub use records::{
    hostname_of, Content, Envelope, FrameDirection, HttpEntry, HttpRequest, HttpResponse,
    NameValue, PostData, SseEvent, Stream, StreamRecord, WsFrame,
};

/// Store operation failures.
#[derive(Debug)]
pub enum StoreError {
    /// Operation on a store after [`Store::close`].
    Closed,
    /// An append reused an identifier already present in the stream.
    DuplicateId(String),
    /// The host rejected the write for lack of space.
    QuotaExceeded,
    /// Any other SQLite failure — surfaced to callers as transient.
    Sqlite(rusqlite::Error),
    /// Record (de)serialization failure.
    Serde(serde_json::Error),
    /// Filesystem failure while opening the store.
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::DuplicateId(id) => write!(f, "duplicate record id: {id}"),
            StoreError::QuotaExceeded => write!(f, "storage quota exceeded"),
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Serde(e) => write!(f, "record serialization error: {e}"),
            StoreError::Io(e) => write!(f, "store io error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if err.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::QuotaExceeded;
            }
        }
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

/// Time-indexed store for the three capture streams and metadata.
pub struct Store {
    conn: Mutex<Option<Connection>>,
    /// Database file path; `None` for in-memory stores (tests).
    path: Option<PathBuf>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS http_entries (
    id       TEXT PRIMARY KEY,
    ts       INTEGER NOT NULL,
    tab_id   INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    body     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_http_ts   ON http_entries (ts);
CREATE INDEX IF NOT EXISTS idx_http_host ON http_entries (hostname);
CREATE INDEX IF NOT EXISTS idx_http_tab  ON http_entries (tab_id);

CREATE TABLE IF NOT EXISTS ws_frames (
    id       TEXT PRIMARY KEY,
    ts       INTEGER NOT NULL,
    tab_id   INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    body     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ws_ts   ON ws_frames (ts);
CREATE INDEX IF NOT EXISTS idx_ws_host ON ws_frames (hostname);
CREATE INDEX IF NOT EXISTS idx_ws_tab  ON ws_frames (tab_id);

CREATE TABLE IF NOT EXISTS sse_events (
    id       TEXT PRIMARY KEY,
    ts       INTEGER NOT NULL,
    tab_id   INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    body     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sse_ts   ON sse_events (ts);
CREATE INDEX IF NOT EXISTS idx_sse_host ON sse_events (hostname);
CREATE INDEX IF NOT EXISTS idx_sse_tab  ON sse_events (tab_id);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

impl Store {
    /// Open (creating if needed) the capture database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    /// Tear down the store. Subsequent operations return [`StoreError::Closed`].
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    /// Append one record. Fills the envelope id (UUID v4) and timestamp
    /// (current wall clock) when absent, and returns the assigned id.
    /// Rejects duplicate identifiers within the stream.
    pub async fn append<R: StreamRecord>(&self, record: &mut R) -> Result<String, StoreError> {
        {
            let env = record.envelope_mut();
            if env.id.is_empty() {
                env.id = uuid::Uuid::new_v4().to_string();
            }
            if env.ts == 0 {
                env.ts = now_ms();
            }
        }
        let body = serde_json::to_string(record)?;
        let env = record.envelope();

        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!(
            "INSERT INTO {} (id, ts, tab_id, hostname, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            R::STREAM.table()
        );
        match conn.execute(
            &sql,
            rusqlite::params![env.id, env.ts, env.tab_id, env.hostname, body],
        ) {
            Ok(_) => Ok(env.id.clone()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateId(env.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read records with `t_lo ≤ ts ≤ t_hi`, ascending by timestamp (ties in
    /// insertion order). An optional tab set narrows the result.
    pub async fn scan<R: StreamRecord>(
        &self,
        t_lo: i64,
        t_hi: i64,
        tab_filter: Option<&HashSet<i64>>,
    ) -> Result<Vec<R>, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let tab_clause = match tab_filter {
            Some(tabs) if !tabs.is_empty() => {
                let ids: Vec<String> = tabs.iter().map(ToString::to_string).collect();
                format!(" AND tab_id IN ({})", ids.join(","))
            }
            Some(_) => " AND 0".to_string(),
            None => String::new(),
        };
        let sql = format!(
            "SELECT body FROM {} WHERE ts >= ?1 AND ts <= ?2{tab_clause} ORDER BY ts ASC, rowid ASC",
            R::STREAM.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![t_lo, t_hi], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    /// Delete every record with `ts ≤ t_cut`. Returns the number removed.
    pub async fn delete_older_than(&self, stream: Stream, t_cut: i64) -> Result<usize, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!("DELETE FROM {} WHERE ts <= ?1", stream.table());
        Ok(conn.execute(&sql, rusqlite::params![t_cut])?)
    }

    /// Delete the `n` records with the smallest timestamps. Returns the
    /// number removed (less than `n` when the stream is shorter).
    pub async fn delete_oldest(&self, stream: Stream, n: usize) -> Result<usize, StoreError> {
        if n == 0 {
            return Ok(0);
        }
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!(
            "DELETE FROM {t} WHERE rowid IN \
             (SELECT rowid FROM {t} ORDER BY ts ASC, rowid ASC LIMIT ?1)",
            t = stream.table()
        );
        Ok(conn.execute(&sql, rusqlite::params![n as i64])?)
    }

    /// Record count for one stream.
    pub async fn count(&self, stream: Stream) -> Result<u64, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!("SELECT COUNT(*) FROM {}", stream.table());
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Minimum and maximum timestamps for one stream; `(None, None)` when empty.
    pub async fn extremes(&self, stream: Stream) -> Result<(Option<i64>, Option<i64>), StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!("SELECT MIN(ts), MAX(ts) FROM {}", stream.table());
        let pair = conn.query_row(&sql, [], |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        Ok(pair)
    }

    /// Best-effort on-disk usage and the host's available ceiling, in bytes.
    pub async fn estimate_usage(&self) -> Result<(u64, u64), StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let usage = (page_count.max(0) as u64).saturating_mul(page_size.max(0) as u64);
        let quota = self.host_quota(usage);
        Ok((usage, quota))
    }

    #[cfg(unix)]
    fn host_quota(&self, usage: u64) -> u64 {
        let Some(ref path) = self.path else {
            return u64::MAX;
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        match nix::sys::statvfs::statvfs(dir) {
            Ok(vfs) => {
                #[allow(clippy::unnecessary_cast)]
                let available =
                    (vfs.blocks_available() as u64).saturating_mul(vfs.fragment_size() as u64);
                available.saturating_add(usage)
            }
            Err(e) => {
                debug!("statvfs failed for {}: {e}", dir.display());
                u64::MAX
            }
        }
    }

    #[cfg(not(unix))]
    fn host_quota(&self, _usage: u64) -> u64 {
        u64::MAX
    }

    /// Write a metadata value (stored as JSON).
    pub async fn put_meta<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, text],
        )?;
        Ok(())
    }

    /// Read a metadata value, `None` when the key is absent.
    pub async fn get_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match text {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }

    /// Wipe the three streams, one transaction per stream. Metadata survives.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        for stream in Stream::ALL {
            conn.execute(&format!("DELETE FROM {}", stream.table()), [])?;
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str, ts: i64, tab: i64) -> WsFrame {
        WsFrame {
            envelope: Envelope {
                id: id.to_string(),
                ts,
                tab_id: tab,
                hostname: "example.com".into(),
            },
            connection_id: "c1".into(),
            url: "wss://example.com/socket".into(),
            direction: FrameDirection::Send,
            opcode: 1,
            data: "hi".into(),
            size: 2,
        }
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let mut f = frame("", 0, 1);
        let id = store.append(&mut f).await.unwrap();
        assert!(!id.is_empty());
        assert!(f.envelope.ts > 0);
        assert_eq!(store.count(Stream::Ws).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_rejects_duplicate_id() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("dup", 1, 1)).await.unwrap();
        let err = store.append(&mut frame("dup", 2, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn scan_orders_by_timestamp_with_stable_ties() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("b", 200, 1)).await.unwrap();
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        store.append(&mut frame("c", 200, 1)).await.unwrap();
        let rows: Vec<WsFrame> = store.scan(0, 1000, None).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.envelope.id.as_str()).collect();
        // equal timestamps keep insertion order: b before c
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn scan_respects_bounds_and_tab_filter() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        store.append(&mut frame("b", 200, 2)).await.unwrap();
        store.append(&mut frame("c", 300, 1)).await.unwrap();

        let rows: Vec<WsFrame> = store.scan(100, 200, None).await.unwrap();
        assert_eq!(rows.len(), 2);

        let tabs: HashSet<i64> = [1].into_iter().collect();
        let rows: Vec<WsFrame> = store.scan(0, 1000, Some(&tabs)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.envelope.tab_id == 1));

        let empty: HashSet<i64> = HashSet::new();
        let rows: Vec<WsFrame> = store.scan(0, 1000, Some(&empty)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn delete_older_than_is_inclusive() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        store.append(&mut frame("b", 200, 1)).await.unwrap();
        store.append(&mut frame("c", 300, 1)).await.unwrap();
        let n = store.delete_older_than(Stream::Ws, 200).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.count(Stream::Ws).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_oldest_takes_smallest_timestamps() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("a", 300, 1)).await.unwrap();
        store.append(&mut frame("b", 100, 1)).await.unwrap();
        store.append(&mut frame("c", 200, 1)).await.unwrap();
        let n = store.delete_oldest(Stream::Ws, 2).await.unwrap();
        assert_eq!(n, 2);
        let rows: Vec<WsFrame> = store.scan(0, 1000, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].envelope.id, "a");
    }

    #[tokio::test]
    async fn extremes_and_count() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.extremes(Stream::Ws).await.unwrap(), (None, None));
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        store.append(&mut frame("b", 300, 1)).await.unwrap();
        assert_eq!(
            store.extremes(Stream::Ws).await.unwrap(),
            (Some(100), Some(300))
        );
    }

    #[tokio::test]
    async fn meta_roundtrip_and_missing_key() {
        let store = Store::open_in_memory().unwrap();
        store.put_meta("last-usage-bytes", &123_456_u64).await.unwrap();
        let v: Option<u64> = store.get_meta("last-usage-bytes").await.unwrap();
        assert_eq!(v, Some(123_456));
        let missing: Option<u64> = store.get_meta("nope").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn clear_all_wipes_streams_but_not_meta() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        store.put_meta("paused", &true).await.unwrap();
        store.clear_all().await.unwrap();
        assert_eq!(store.count(Stream::Ws).await.unwrap(), 0);
        let paused: Option<bool> = store.get_meta("paused").await.unwrap();
        assert_eq!(paused, Some(true));
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let store = Store::open_in_memory().unwrap();
        store.close().await;
        let err = store.append(&mut frame("a", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn usage_estimate_is_nonzero() {
        let store = Store::open_in_memory().unwrap();
        store.append(&mut frame("a", 100, 1)).await.unwrap();
        let (usage, quota) = store.estimate_usage().await.unwrap();
        assert!(usage > 0);
        assert!(quota >= usage);
    }
}
