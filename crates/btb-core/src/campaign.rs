//! Campaign content and the operator-input parsers that build it.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CampaignId, TemplateId, UserId},
    errors::Error,
    messaging::types::LinkButton,
    segment::Segment,
    Result,
};

/// Telegram's limit for message text.
pub const MAX_TEXT_LEN: usize = 4096;
/// Telegram's limit for a photo caption.
pub const MAX_CAPTION_LEN: usize = 1024;
/// Operator-facing schedule format (server local time).
pub const SCHEDULE_FORMAT: &str = "%d.%m.%Y %H:%M";

const URL_PREFIXES: [&str; 4] = ["http://", "https://", "tg://", "t.me/"];

/// What gets delivered: HTML text and/or an image, plus optional URL buttons.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignContent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<LinkButton>,
}

impl CampaignContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn has_image(&self) -> bool {
        self.image_ref.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Pre-flight check run before anything is persisted or sent.
    pub fn validate(&self) -> Result<()> {
        if !self.has_text() && !self.has_image() {
            return Err(Error::InvalidInput(
                "campaign has neither text nor an image".to_string(),
            ));
        }

        let len = self.text.chars().count();
        let limit = if self.has_image() {
            MAX_CAPTION_LEN
        } else {
            MAX_TEXT_LEN
        };
        if len > limit {
            return Err(Error::InvalidInput(format!(
                "text is {len} characters, the limit is {limit}"
            )));
        }

        for b in &self.buttons {
            if b.text.trim().is_empty() || !is_button_url(&b.url) {
                return Err(Error::InvalidInput(format!(
                    "invalid button: {} | {}",
                    b.text, b.url
                )));
            }
        }
        Ok(())
    }
}

/// A finished campaign handed over by the front-end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignPayload {
    pub content: CampaignContent,
    pub segment: Segment,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A persisted campaign row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub operator_id: UserId,
    pub content: CampaignContent,
    /// Raw label as stored; resolved with [`Segment::parse`] at send time.
    pub segment: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub pending: bool,
    pub sent_count: u64,
    pub failed_count: u64,
}

impl Campaign {
    pub fn segment(&self) -> Segment {
        Segment::parse(&self.segment)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }
}

/// A saved, reusable campaign body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Template {
    pub id: TemplateId,
    pub operator_id: UserId,
    pub name: String,
    pub body: String,
    pub image_ref: Option<String>,
    pub buttons: Vec<LinkButton>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    /// Campaign content reproducing this template exactly.
    pub fn to_content(&self) -> CampaignContent {
        CampaignContent {
            text: self.body.clone(),
            image_ref: self.image_ref.clone(),
            buttons: self.buttons.clone(),
        }
    }
}

/// Delivery statistics of one dispatch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub sent: u64,
    pub failed: u64,
}

impl DeliveryOutcome {
    pub fn total(&self) -> u64 {
        self.sent + self.failed
    }
}

pub fn is_button_url(url: &str) -> bool {
    URL_PREFIXES.iter().any(|p| url.starts_with(p))
}

/// Parse `Label | URL` lines. Lines that don't fit the format are skipped.
pub fn parse_buttons(input: &str) -> Vec<LinkButton> {
    input
        .lines()
        .filter_map(|line| {
            let (text, url) = line.trim().split_once('|')?;
            let (text, url) = (text.trim(), url.trim());
            if text.is_empty() || !is_button_url(url) {
                return None;
            }
            Some(LinkButton {
                text: text.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

/// Parse `DD.MM.YYYY HH:MM` in server local time; the result must lie after `now`.
pub fn parse_schedule_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_schedule_time_in(input, now, &Local)
}

pub fn parse_schedule_time_in<Tz: TimeZone>(
    input: &str,
    now: DateTime<Utc>,
    tz: &Tz,
) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(input.trim(), SCHEDULE_FORMAT).map_err(|_| {
        Error::InvalidInput(format!(
            "expected a date like 25.12.2026 15:30, got {:?}",
            input.trim()
        ))
    })?;
    let at = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::InvalidInput("that local time does not exist".to_string()))?
        .with_timezone(&Utc);
    if at <= now {
        return Err(Error::InvalidInput(
            "the scheduled time must be in the future".to_string(),
        ));
    }
    Ok(at)
}
