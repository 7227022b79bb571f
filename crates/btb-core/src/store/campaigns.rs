use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{
    campaign::{Campaign, CampaignContent, DeliveryOutcome},
    domain::{CampaignId, UserId},
    errors::Error,
    segment::Segment,
    store::{fmt_ts, json_column, opt_ts_column, ts_column, Store},
    Result,
};

const COLUMNS: &str = "id, operator_id, body_json, segment, created_at, scheduled_at, pending, sent_count, failed_count";

/// Aggregate campaign counters for analytics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub delivered: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub pending_scheduled: u64,
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let sent: i64 = row.get(7)?;
    let failed: i64 = row.get(8)?;
    Ok(Campaign {
        id: CampaignId(row.get(0)?),
        operator_id: UserId(row.get(1)?),
        content: json_column(row, 2)?,
        segment: row.get(3)?,
        created_at: ts_column(row, 4)?,
        scheduled_at: opt_ts_column(row, 5)?,
        pending: row.get(6)?,
        sent_count: sent.max(0) as u64,
        failed_count: failed.max(0) as u64,
    })
}

impl Store {
    pub fn create_immediate(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
    ) -> Result<CampaignId> {
        self.create_immediate_at(operator, content, segment, Utc::now())
    }

    pub fn create_immediate_at(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        now: DateTime<Utc>,
    ) -> Result<CampaignId> {
        self.insert_campaign(operator, content, segment, now, None)
    }

    pub fn create_scheduled(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        scheduled_at: DateTime<Utc>,
    ) -> Result<CampaignId> {
        self.create_scheduled_at(operator, content, segment, scheduled_at, Utc::now())
    }

    pub fn create_scheduled_at(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CampaignId> {
        self.insert_campaign(operator, content, segment, now, Some(scheduled_at))
    }

    fn insert_campaign(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        now: DateTime<Utc>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<CampaignId> {
        let body = serde_json::to_string(content)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO campaigns (operator_id, body_json, segment, created_at, scheduled_at, pending)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                operator.0,
                body,
                segment.label(),
                fmt_ts(now),
                scheduled_at.map(fmt_ts)
            ],
        )?;
        Ok(CampaignId(conn.last_insert_rowid()))
    }

    pub fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let sql = format!("SELECT {COLUMNS} FROM campaigns WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, [id.0], campaign_from_row)
            .optional()?)
    }

    /// Persist the final counts of a finished dispatch pass.
    pub fn record_outcome(&self, id: CampaignId, outcome: DeliveryOutcome) -> Result<()> {
        let sent = i64::try_from(outcome.sent).unwrap_or(i64::MAX);
        let failed = i64::try_from(outcome.failed).unwrap_or(i64::MAX);
        let changed = self.conn().execute(
            "UPDATE campaigns SET sent_count = ?2, failed_count = ?3 WHERE id = ?1",
            params![id.0, sent, failed],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("campaign {id}")));
        }
        Ok(())
    }

    /// Clear the pending flag. Returns `false` if it was already cleared.
    pub fn mark_delivered(&self, id: CampaignId) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE campaigns SET pending = 0 WHERE id = ?1 AND pending = 1",
            [id.0],
        )?;
        Ok(changed > 0)
    }

    /// Newest first. Without `include_scheduled`, campaigns still waiting for
    /// their scheduled time are left out.
    pub fn list_recent(&self, limit: usize, include_scheduled: bool) -> Result<Vec<Campaign>> {
        let filter = if include_scheduled {
            ""
        } else {
            "WHERE NOT (scheduled_at IS NOT NULL AND pending = 1)"
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM campaigns {filter} ORDER BY created_at DESC, id DESC LIMIT ?1"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], campaign_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Scheduled campaigns whose time has come and that are still pending.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM campaigns
             WHERE pending = 1 AND scheduled_at IS NOT NULL AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC, id ASC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fmt_ts(now)], campaign_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Scheduled campaigns still in the future, soonest first.
    pub fn list_upcoming(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM campaigns
             WHERE pending = 1 AND scheduled_at IS NOT NULL AND scheduled_at > ?1
             ORDER BY scheduled_at ASC, id ASC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fmt_ts(now)], campaign_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The operator's most recent finished campaign (source for templates).
    pub fn last_delivered_by(&self, operator: UserId) -> Result<Option<Campaign>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM campaigns
             WHERE operator_id = ?1 AND pending = 0
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        Ok(self
            .conn()
            .query_row(&sql, [operator.0], campaign_from_row)
            .optional()?)
    }

    pub fn campaign_stats(&self) -> Result<CampaignStats> {
        let conn = self.conn();
        let (delivered, sent, failed): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(sent_count), 0), COALESCE(SUM(failed_count), 0)
             FROM campaigns WHERE pending = 0",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM campaigns WHERE pending = 1 AND scheduled_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(CampaignStats {
            delivered: delivered.max(0) as u64,
            total_sent: sent.max(0) as u64,
            total_failed: failed.max(0) as u64,
            pending_scheduled: pending.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messaging::types::LinkButton, store::test_support::at};

    fn content() -> CampaignContent {
        CampaignContent {
            text: "<b>Hello</b>".to_string(),
            image_ref: Some("AgACAgIAAxkBAAI".to_string()),
            buttons: vec![LinkButton {
                text: "Open".to_string(),
                url: "https://example.com".to_string(),
            }],
        }
    }

    #[test]
    fn immediate_campaign_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let op = UserId(10);
        let id = store
            .create_immediate_at(op, &content(), Segment::New, at(2026, 3, 1, 10, 0))
            .unwrap();

        let c = store.get_campaign(id).unwrap().unwrap();
        assert!(c.pending);
        assert_eq!((c.sent_count, c.failed_count), (0, 0));
        assert_eq!(c.content, content());
        assert_eq!(c.segment(), Segment::New);

        store
            .record_outcome(id, DeliveryOutcome { sent: 4, failed: 1 })
            .unwrap();
        assert!(store.mark_delivered(id).unwrap());
        assert!(!store.mark_delivered(id).unwrap());

        let c = store.get_campaign(id).unwrap().unwrap();
        assert!(!c.pending);
        assert_eq!((c.sent_count, c.failed_count), (4, 1));
        assert_eq!(store.last_delivered_by(op).unwrap().unwrap().id, id);
        assert!(store.last_delivered_by(UserId(11)).unwrap().is_none());
    }

    #[test]
    fn record_outcome_for_unknown_campaign_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .record_outcome(CampaignId(77), DeliveryOutcome::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn due_and_upcoming_split_on_now() {
        let store = Store::open_in_memory().unwrap();
        let op = UserId(1);
        let now = at(2026, 3, 10, 12, 0);
        let past = store
            .create_scheduled_at(op, &content(), Segment::All, at(2026, 3, 9, 0, 0), now)
            .unwrap();
        let exact = store
            .create_scheduled_at(op, &content(), Segment::All, now, now)
            .unwrap();
        let future = store
            .create_scheduled_at(op, &content(), Segment::All, at(2026, 3, 11, 0, 0), now)
            .unwrap();
        store.create_immediate_at(op, &content(), Segment::All, now).unwrap();

        let due: Vec<_> = store.list_due(now).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(due, vec![past, exact]);
        let upcoming: Vec<_> = store.list_upcoming(now).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(upcoming, vec![future]);

        store.mark_delivered(past).unwrap();
        let due: Vec<_> = store.list_due(now).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(due, vec![exact]);
    }

    #[test]
    fn list_recent_hides_pending_scheduled_by_default() {
        let store = Store::open_in_memory().unwrap();
        let op = UserId(1);
        let sched = store
            .create_scheduled_at(
                op,
                &content(),
                Segment::All,
                at(2026, 4, 1, 0, 0),
                at(2026, 3, 1, 0, 0),
            )
            .unwrap();
        let sent = store
            .create_immediate_at(op, &content(), Segment::All, at(2026, 3, 2, 0, 0))
            .unwrap();
        store.mark_delivered(sent).unwrap();

        let recent: Vec<_> = store.list_recent(10, false).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(recent, vec![sent]);
        let all: Vec<_> = store.list_recent(10, true).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(all, vec![sent, sched]);
        assert_eq!(store.list_recent(1, true).unwrap().len(), 1);
    }

    #[test]
    fn stats_sum_delivered_campaigns() {
        let store = Store::open_in_memory().unwrap();
        let op = UserId(1);
        for (sent, failed) in [(3, 1), (5, 0)] {
            let id = store.create_immediate(op, &content(), Segment::All).unwrap();
            store
                .record_outcome(id, DeliveryOutcome { sent, failed })
                .unwrap();
            store.mark_delivered(id).unwrap();
        }
        store
            .create_scheduled(op, &content(), Segment::All, Utc::now())
            .unwrap();

        assert_eq!(
            store.campaign_stats().unwrap(),
            CampaignStats {
                delivered: 2,
                total_sent: 8,
                total_failed: 1,
                pending_scheduled: 1,
            }
        );
    }
}
