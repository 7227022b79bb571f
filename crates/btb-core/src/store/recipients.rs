use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{
    domain::UserId,
    store::{fmt_ts, ts_column, Store},
    Result,
};

const MAX_SEARCH_RESULTS: usize = 20;

const COLUMNS: &str =
    "id, username, first_name, last_name, referral_tag, registered_at, last_activity, active";

/// A registered end-user addressable for delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub referral_tag: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
}

impl Recipient {
    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if full.trim().is_empty() {
            "No name".to_string()
        } else {
            full
        }
    }

    fn matches(&self, needle_lower: &str) -> bool {
        [&self.username, &self.first_name, &self.last_name]
            .into_iter()
            .flatten()
            .any(|f| f.to_lowercase().contains(needle_lower))
    }
}

/// Name fields reported by Telegram on each contact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Predicate over *active* recipients used by segmentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityFilter {
    Any,
    RegisteredSince(DateTime<Utc>),
    SeenSince(DateTime<Utc>),
    NotSeenSince(DateTime<Utc>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub day: NaiveDate,
    pub count: u64,
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        referral_tag: row.get(4)?,
        registered_at: ts_column(row, 5)?,
        last_activity: ts_column(row, 6)?,
        active: row.get(7)?,
    })
}

impl Store {
    /// Register a contact. Returns `true` on first-ever contact.
    pub fn upsert(&self, id: UserId, profile: &Profile, referral: Option<&str>) -> Result<bool> {
        self.upsert_at(id, profile, referral, Utc::now())
    }

    pub fn upsert_at(
        &self,
        id: UserId,
        profile: &Profile,
        referral: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = fmt_ts(now);
        let referral = referral.map(str::trim).filter(|r| !r.is_empty());
        let conn = self.conn();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO recipients
               (id, username, first_name, last_name, referral_tag, registered_at, last_activity, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)",
            params![
                id.0,
                profile.username,
                profile.first_name,
                profile.last_name,
                referral,
                now
            ],
        )?;
        if inserted == 1 {
            return Ok(true);
        }

        // Returning contact: refresh names, keep the original referral unless a new one is given.
        conn.execute(
            "UPDATE recipients
             SET username = ?2, first_name = ?3, last_name = ?4,
                 referral_tag = COALESCE(?5, referral_tag), last_activity = ?6
             WHERE id = ?1",
            params![
                id.0,
                profile.username,
                profile.first_name,
                profile.last_name,
                referral,
                now
            ],
        )?;
        Ok(false)
    }

    pub fn get_recipient(&self, id: UserId) -> Result<Option<Recipient>> {
        let conn = self.conn();
        let sql = format!("SELECT {COLUMNS} FROM recipients WHERE id = ?1");
        Ok(conn
            .query_row(&sql, [id.0], recipient_from_row)
            .optional()?)
    }

    /// Returns `false` when the recipient is unknown. Idempotent.
    pub fn set_active(&self, id: UserId, active: bool) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE recipients SET active = ?2 WHERE id = ?1",
            params![id.0, active],
        )?;
        Ok(changed > 0)
    }

    /// Flip the active flag; returns the new state, or `None` for an unknown id.
    pub fn toggle_active(&self, id: UserId) -> Result<Option<bool>> {
        let conn = self.conn();
        let current: Option<bool> = conn
            .query_row("SELECT active FROM recipients WHERE id = ?1", [id.0], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE recipients SET active = ?2 WHERE id = ?1",
            params![id.0, !current],
        )?;
        Ok(Some(!current))
    }

    /// Exact id match first, otherwise a case-insensitive substring match over
    /// username and names, newest registrations first.
    pub fn search(&self, query: &str) -> Result<Vec<Recipient>> {
        let query = query.trim().trim_start_matches('@');
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Ok(id) = query.parse::<i64>() {
            if let Some(r) = self.get_recipient(UserId(id))? {
                return Ok(vec![r]);
            }
        }

        // SQLite's LIKE only folds ASCII; names are often Cyrillic, so filter here.
        let needle = query.to_lowercase();
        let conn = self.conn();
        let sql =
            format!("SELECT {COLUMNS} FROM recipients ORDER BY registered_at DESC, id DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], recipient_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            let r = row?;
            if r.matches(&needle) {
                out.push(r);
                if out.len() >= MAX_SEARCH_RESULTS {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self, only_active: bool) -> Result<u64> {
        let sql = if only_active {
            "SELECT COUNT(*) FROM recipients WHERE active = 1"
        } else {
            "SELECT COUNT(*) FROM recipients"
        };
        Ok(self.conn().query_row(sql, [], |r| r.get(0))?)
    }

    pub fn count_registered_since(&self, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM recipients WHERE active = 1 AND registered_at >= ?1",
            [fmt_ts(since)],
            |r| r.get(0),
        )?)
    }

    pub fn count_active_since(&self, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM recipients WHERE active = 1 AND last_activity >= ?1",
            [fmt_ts(since)],
            |r| r.get(0),
        )?)
    }

    /// Registrations per UTC day over the trailing `days`, newest day first.
    pub fn registrations_by_day(&self, days: u32) -> Result<Vec<DayCount>> {
        self.registrations_by_day_at(days, Utc::now())
    }

    pub fn registrations_by_day_at(&self, days: u32, now: DateTime<Utc>) -> Result<Vec<DayCount>> {
        let since = fmt_ts(now - Duration::days(i64::from(days)));
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT substr(registered_at, 1, 10) AS day, COUNT(*)
             FROM recipients
             WHERE registered_at >= ?1
             GROUP BY day
             ORDER BY day DESC",
        )?;
        let rows = stmt.query_map([since], |r| {
            let raw: String = r.get(0)?;
            let day = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(DayCount {
                day,
                count: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ids of active recipients matching `filter`, ascending.
    pub fn active_recipient_ids(&self, filter: ActivityFilter) -> Result<Vec<UserId>> {
        let (sql, bound) = match filter {
            ActivityFilter::Any => (
                "SELECT id FROM recipients WHERE active = 1 ORDER BY id",
                None,
            ),
            ActivityFilter::RegisteredSince(ts) => (
                "SELECT id FROM recipients WHERE active = 1 AND registered_at >= ?1 ORDER BY id",
                Some(ts),
            ),
            ActivityFilter::SeenSince(ts) => (
                "SELECT id FROM recipients WHERE active = 1 AND last_activity >= ?1 ORDER BY id",
                Some(ts),
            ),
            ActivityFilter::NotSeenSince(ts) => (
                "SELECT id FROM recipients WHERE active = 1 AND last_activity < ?1 ORDER BY id",
                Some(ts),
            ),
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let ids = match bound {
            Some(ts) => stmt
                .query_map([fmt_ts(ts)], |r| r.get(0).map(UserId))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], |r| r.get(0).map(UserId))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(ids)
    }
}
