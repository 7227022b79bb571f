//! Telegram HTML snippets shared by the admin front-end, the dispatcher and
//! the scheduler.

use chrono::{DateTime, Local, Utc};

use crate::{
    campaign::{Campaign, DeliveryOutcome, Template},
    store::recipients::Recipient,
};

const BAR_FILLED: char = '█';
const BAR_EMPTY: char = '▱';
const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Truncate to at most `max_len` characters, marking the cut with `...`.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Fixed-width bar for `value / max`.
pub fn bar(value: u64, max: u64, width: usize) -> String {
    let filled = if max == 0 {
        0
    } else {
        ((value.min(max) as u128 * width as u128) / max as u128) as usize
    };
    let mut out = String::with_capacity(width * 3);
    out.extend(std::iter::repeat(BAR_FILLED).take(filled));
    out.extend(std::iter::repeat(BAR_EMPTY).take(width - filled));
    out
}

pub fn percent(value: usize, total: usize) -> usize {
    if total == 0 {
        100
    } else {
        value.min(total) * 100 / total
    }
}

/// Body of the live progress message edited during a dispatch pass.
pub fn progress_html(processed: usize, total: usize, sent: u64, failed: u64) -> String {
    let pct = percent(processed, total);
    format!(
        "⏳ <b>Broadcast in progress...</b>\n\n{RULE}\n{} {pct}%\n\
         👥 Recipients: {processed}/{total}\n✅ Sent: {sent}\n❌ Failed: {failed}",
        bar(pct as u64, 100, 20)
    )
}

pub fn outcome_html(outcome: DeliveryOutcome) -> String {
    let total = outcome.total();
    let rate = if total == 0 {
        0.0
    } else {
        outcome.sent as f64 * 100.0 / total as f64
    };
    format!(
        "✅ <b>Broadcast finished</b>\n\n{RULE}\n\
         👥 Recipients: {total}\n✅ Sent: {}\n❌ Failed: {}\n📈 Delivery rate: {rate:.1}%",
        outcome.sent, outcome.failed
    )
}

/// Server-local `DD.MM.YYYY HH:MM`, the same layout operators type in.
pub fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string()
}

pub fn recipient_card_html(r: &Recipient) -> String {
    let username = r
        .username
        .as_deref()
        .map(|u| format!("@{}", escape_html(u)))
        .unwrap_or_else(|| "none".to_string());
    let status = if r.active { "✅ Active" } else { "🚫 Blocked" };
    let mut out = format!(
        "👤 <b>{}</b>\n\n🆔 ID: <code>{}</code>\n📛 Username: {username}\n\
         📅 Registered: {}\n🕐 Last activity: {}\n📊 Status: {status}",
        escape_html(&r.display_name()),
        r.id,
        local_time(r.registered_at),
        local_time(r.last_activity),
    );
    if let Some(tag) = r.referral_tag.as_deref() {
        out.push_str(&format!("\n🔗 Referral: <code>{}</code>", escape_html(tag)));
    }
    out
}

/// One line per campaign for `/history` and `/scheduled`.
pub fn campaign_line_html(c: &Campaign) -> String {
    let preview = if c.content.has_text() {
        escape_html(&truncate_text(c.content.text.trim(), 40))
    } else {
        "🖼 image".to_string()
    };
    match (c.scheduled_at, c.pending) {
        (Some(at), true) => format!(
            "⏰ <b>#{}</b> {} · {} · {preview}",
            c.id.0,
            local_time(at),
            c.segment()
        ),
        _ => format!(
            "📨 <b>#{}</b> {} · {} · ✅ {} ❌ {} · {preview}",
            c.id.0,
            local_time(c.created_at),
            c.segment(),
            c.sent_count,
            c.failed_count
        ),
    }
}

pub fn template_preview_html(t: &Template) -> String {
    let mut out = format!("📋 <b>{}</b>\n\n", escape_html(&t.name));
    if t.image_ref.is_some() {
        out.push_str("🖼 with image\n");
    }
    if !t.buttons.is_empty() {
        out.push_str(&format!("🔘 buttons: {}\n", t.buttons.len()));
    }
    if !t.body.trim().is_empty() {
        // A cut could land inside a tag, so show the source.
        out.push('\n');
        out.push_str(&escape_html(&truncate_text(&t.body, 300)));
    }
    out
}
