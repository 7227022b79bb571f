use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    campaign::{CampaignContent, Template},
    domain::{TemplateId, UserId},
    messaging::types::LinkButton,
    store::{fmt_ts, ts_column, Store},
    Result,
};

const COLUMNS: &str = "id, operator_id, name, body, image_ref, buttons_json, created_at";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    let buttons_json: Option<String> = row.get(5)?;
    let buttons: Vec<LinkButton> = match buttons_json {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        _ => Vec::new(),
    };
    Ok(Template {
        id: TemplateId(row.get(0)?),
        operator_id: UserId(row.get(1)?),
        name: row.get(2)?,
        body: row.get(3)?,
        image_ref: row.get(4)?,
        buttons,
        created_at: ts_column(row, 6)?,
    })
}

impl Store {
    /// Names are not unique; an owner may keep several templates with one name.
    pub fn save_template(
        &self,
        operator: UserId,
        name: &str,
        content: &CampaignContent,
    ) -> Result<TemplateId> {
        self.save_template_at(operator, name, content, Utc::now())
    }

    pub fn save_template_at(
        &self,
        operator: UserId,
        name: &str,
        content: &CampaignContent,
        now: DateTime<Utc>,
    ) -> Result<TemplateId> {
        let buttons_json = if content.buttons.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&content.buttons)?)
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO templates (name, operator_id, body, image_ref, buttons_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                operator.0,
                content.text,
                content.image_ref,
                buttons_json,
                fmt_ts(now)
            ],
        )?;
        Ok(TemplateId(conn.last_insert_rowid()))
    }

    /// Newest first.
    pub fn list_templates(&self, owner: UserId) -> Result<Vec<Template>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM templates WHERE operator_id = ?1 ORDER BY created_at DESC, id DESC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([owner.0], template_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_template(&self, id: TemplateId) -> Result<Option<Template>> {
        let sql = format!("SELECT {COLUMNS} FROM templates WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, [id.0], template_from_row)
            .optional()?)
    }

    /// Deletes only when `owner` owns the template; returns whether a row went away.
    pub fn delete_template(&self, id: TemplateId, owner: UserId) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM templates WHERE id = ?1 AND operator_id = ?2",
            params![id.0, owner.0],
        )?;
        Ok(changed > 0)
    }
}
