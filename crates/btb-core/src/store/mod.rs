//! SQLite-backed persistence for recipients, campaigns and templates.
//!
//! One `Connection` behind a `std::sync::Mutex`: every call is a short
//! statement or transaction and the guard is never held across `.await`.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{types::Type, Connection, Row};

use crate::Result;

pub mod campaigns;
pub mod recipients;
pub mod templates;

/// Timestamp layout used for every persisted time (same as SQLite's
/// `CURRENT_TIMESTAMP`), so lexical order equals chronological order.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recipients (
    id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    referral_tag TEXT,
    registered_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operator_id INTEGER NOT NULL,
    body_json TEXT NOT NULL,
    sent_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    scheduled_at TEXT,
    pending INTEGER NOT NULL DEFAULT 1,
    segment TEXT NOT NULL DEFAULT 'all'
);

CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    operator_id INTEGER NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    image_ref TEXT,
    buttons_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recipients_active ON recipients(active);
CREATE INDEX IF NOT EXISTS idx_recipients_registered ON recipients(registered_at);
CREATE INDEX IF NOT EXISTS idx_campaigns_created ON campaigns(created_at);
CREATE INDEX IF NOT EXISTS idx_campaigns_due ON campaigns(pending, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_templates_operator ON templates(operator_id);
";

/// Persisted state shared by both bots, the dispatcher and the scheduler.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database file and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL lets reporting reads proceed while a dispatch writes outcomes.
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL;") {
            tracing::warn!("could not enable WAL mode: {e}");
        }
        Self::init(conn)
    }

    /// Fresh private database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-applied in SQLite; keep going.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT).map(|n| n.and_utc())
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
