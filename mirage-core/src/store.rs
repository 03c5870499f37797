use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::events::{EventPayload, EventSink, SessionEvent, SinkError};
use crate::session::SessionRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store path not configured")]
    MissingPath,
    #[error("failed to open event database {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

const EVENT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_s REAL,
    success INTEGER NOT NULL DEFAULT 0,
    target_url TEXT,
    device TEXT,
    proxy TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events (session_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type);
";

#[derive(Debug, Clone)]
pub struct SqliteEventStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteEventStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteEventStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteEventStore> {
        let path = self.path.ok_or(StoreError::MissingPath)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteEventStore { path, flags })
    }
}

/// Durable observer: persists finished sessions and every emitted event,
/// and answers aggregate statistics queries over both.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    path: PathBuf,
    flags: OpenFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    pub total_clicks: u64,
    pub average_duration_s: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_s: f64,
    pub success: bool,
    pub target_url: String,
    pub device: String,
    pub proxy: Option<String>,
}

impl SqliteEventStore {
    pub fn builder() -> SqliteEventStoreBuilder {
        SqliteEventStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteEventStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(EVENT_SCHEMA)?;
        Ok(())
    }

    pub fn save_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let conn = self.open()?;
        let ended_at =
            record.started_at + ChronoDuration::milliseconds((record.duration_s * 1000.0) as i64);
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (session_id, started_at, ended_at, duration_s, success, target_url, device, proxy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.session_id,
                record.started_at.to_rfc3339(),
                ended_at.to_rfc3339(),
                record.duration_s,
                record.success as i64,
                record.target_url,
                record.device,
                record.proxy,
            ],
        )?;
        Ok(())
    }

    pub fn save_event(&self, event: &SessionEvent) -> StoreResult<()> {
        let conn = self.open()?;
        let payload = serde_json::to_string(&event.payload)?;
        conn.execute(
            "INSERT INTO events (session_id, event_type, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.session_id,
                event.kind(),
                event.timestamp.to_rfc3339(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn statistics(&self) -> StoreResult<StoreStatistics> {
        let conn = self.open()?;
        let total_sessions: u64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let successful_sessions: u64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE success = 1",
            [],
            |row| row.get(0),
        )?;
        let failed_sessions: u64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        let total_clicks: u64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_type = 'click'",
            [],
            |row| row.get(0),
        )?;
        let average_duration_s: Option<f64> = conn.query_row(
            "SELECT AVG(duration_s) FROM sessions WHERE duration_s IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreStatistics {
            total_sessions,
            successful_sessions,
            failed_sessions,
            total_clicks,
            average_duration_s: average_duration_s.unwrap_or(0.0),
            success_rate: if total_sessions > 0 {
                successful_sessions as f64 / total_sessions as f64
            } else {
                0.0
            },
        })
    }

    pub fn recent_sessions(&self, limit: usize) -> StoreResult<Vec<SessionSummary>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT session_id, started_at, duration_s, success, target_url, device, proxy
             FROM sessions ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![limit as i64], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                started_at: parse_timestamp(row.get::<_, String>(1)?),
                duration_s: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                success: row.get::<_, i64>(3)? != 0,
                target_url: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                device: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                proxy: row.get(6)?,
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    pub fn events_for_session(&self, session_id: &str) -> StoreResult<Vec<SessionEvent>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT session_id, timestamp, payload FROM events
             WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (session_id, timestamp, payload) = row?;
            let payload: EventPayload = serde_json::from_str(&payload)?;
            events.push(SessionEvent {
                session_id,
                timestamp: parse_timestamp(timestamp),
                payload,
            });
        }
        Ok(events)
    }
}

impl EventSink for SqliteEventStore {
    fn name(&self) -> &str {
        "store"
    }

    fn deliver(&self, event: &SessionEvent) -> Result<(), SinkError> {
        self.save_event(event)
            .map_err(|err| SinkError::Storage(err.to_string()))
    }
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::session::SessionState;
    use tempfile::tempdir;

    fn scratch_store() -> (tempfile::TempDir, SqliteEventStore) {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::new(dir.path().join("events.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn record(id: &str, success: bool, duration_s: f64) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            device: "Desktop Chrome".into(),
            proxy: Some("synthetic-ip-001".into()),
            target_url: "https://www.google.com/search?q=rust".into(),
            started_at: Utc::now(),
            duration_s,
            success,
            state: if success {
                SessionState::Succeeded
            } else {
                SessionState::Failed
            },
            events: Vec::new(),
        }
    }

    #[test]
    fn statistics_aggregate_sessions_and_clicks() {
        let (_dir, store) = scratch_store();
        store.save_session(&record("s1", true, 4.0)).unwrap();
        store.save_session(&record("s2", false, 2.0)).unwrap();
        store
            .save_event(&SessionEvent::new(
                "s1",
                EventPayload::Click {
                    url: "https://example.com".into(),
                },
            ))
            .unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.successful_sessions, 1);
        assert_eq!(stats.failed_sessions, 1);
        assert_eq!(stats.total_clicks, 1);
        assert!((stats.average_duration_s - 3.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn statistics_on_empty_store_are_zero() {
        let (_dir, store) = scratch_store();
        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_duration_s, 0.0);
    }

    #[test]
    fn events_round_trip_through_the_payload_column() {
        let (_dir, store) = scratch_store();
        let scroll = SessionEvent::new("s1", EventPayload::Scroll { depth_pct: 55 });
        let error = SessionEvent::new(
            "s1",
            EventPayload::Error {
                message: "navigation failed".into(),
            },
        );
        store.save_event(&scroll).unwrap();
        store.save_event(&error).unwrap();

        let loaded = store.events_for_session("s1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].payload, scroll.payload);
        assert_eq!(loaded[1].payload, error.payload);
        assert!(store.events_for_session("missing").unwrap().is_empty());
    }

    #[test]
    fn recent_sessions_are_ordered_newest_first() {
        let (_dir, store) = scratch_store();
        let mut older = record("old", true, 1.0);
        older.started_at = Utc::now() - ChronoDuration::minutes(5);
        store.save_session(&older).unwrap();
        store.save_session(&record("new", false, 1.0)).unwrap();

        let recent = store.recent_sessions(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "new");
    }

    #[test]
    fn missing_path_is_rejected_by_the_builder() {
        assert!(matches!(
            SqliteEventStoreBuilder::new().build(),
            Err(StoreError::MissingPath)
        ));
    }
}
