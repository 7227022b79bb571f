//! Operator-facing statistics derived from the store.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    formatting::bar,
    segment::{self, Segment, ACTIVITY_WINDOW_DAYS, NEW_WINDOW_DAYS},
    store::{campaigns::CampaignStats, recipients::DayCount, Store},
    Result,
};

/// Days covered by the growth chart.
pub const GROWTH_DAYS: u32 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DetailedStats {
    pub total_users: u64,
    pub blocked_users: u64,
    pub new_today: u64,
    pub new_week: u64,
    pub new_month: u64,
    pub active_month: u64,
    pub segment_sizes: Vec<(&'static str, u64)>,
    pub campaigns: CampaignStats,
}

impl DetailedStats {
    /// Share of active-in-30-days users, in percent.
    pub fn active_rate(&self) -> f64 {
        if self.total_users == 0 {
            return 0.0;
        }
        self.active_month as f64 * 100.0 / self.total_users as f64
    }

    pub fn avg_sent_per_campaign(&self) -> u64 {
        if self.campaigns.delivered == 0 {
            return 0;
        }
        self.campaigns.total_sent / self.campaigns.delivered
    }
}

pub fn detailed_stats(store: &Store) -> Result<DetailedStats> {
    detailed_stats_at(store, Utc::now())
}

pub fn detailed_stats_at(store: &Store, now: DateTime<Utc>) -> Result<DetailedStats> {
    let start_of_day = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(now);

    let total_users = store.count(true)?;
    let mut segment_sizes = Vec::with_capacity(Segment::ALL.len());
    for seg in Segment::ALL {
        let n = segment::resolve_at(store, seg, now)?.len() as u64;
        segment_sizes.push((seg.label(), n));
    }

    Ok(DetailedStats {
        total_users,
        blocked_users: store.count(false)?.saturating_sub(total_users),
        new_today: store.count_registered_since(start_of_day)?,
        new_week: store.count_registered_since(now - Duration::days(NEW_WINDOW_DAYS))?,
        new_month: store.count_registered_since(now - Duration::days(ACTIVITY_WINDOW_DAYS))?,
        active_month: store.count_active_since(now - Duration::days(ACTIVITY_WINDOW_DAYS))?,
        segment_sizes,
        campaigns: store.campaign_stats()?,
    })
}

/// Text chart, oldest day first; bars are scaled to the busiest day.
pub fn growth_chart(days: &[DayCount], width: usize) -> String {
    if days.is_empty() {
        return "No registrations in this period".to_string();
    }
    let max = days.iter().map(|d| d.count).max().unwrap_or(0);
    days.iter()
        .rev()
        .map(|d| {
            format!(
                "{}: {} {}",
                d.day.format("%d.%m"),
                bar(d.count, max, width),
                d.count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn growth_report(store: &Store, days: u32) -> Result<String> {
    growth_report_at(store, days, Utc::now())
}

pub fn growth_report_at(store: &Store, days: u32, now: DateTime<Utc>) -> Result<String> {
    let buckets = store.registrations_by_day_at(days, now)?;
    Ok(format!(
        "📈 <b>User growth ({days} days)</b>\n\n{}",
        growth_chart(&buckets, 30)
    ))
}

pub fn summary_html(stats: &DetailedStats) -> String {
    let mut out = String::from("📊 <b>Analytics</b>\n\n👥 <b>Users</b>\n");
    out.push_str(&format!("• Total: <b>{}</b>\n", stats.total_users));
    out.push_str(&format!("• Blocked: <b>{}</b>\n", stats.blocked_users));
    out.push_str(&format!("• New today: <b>{}</b>\n", stats.new_today));
    out.push_str(&format!("• New this week: <b>{}</b>\n", stats.new_week));
    out.push_str(&format!("• New this month: <b>{}</b>\n", stats.new_month));
    out.push_str(&format!("• Active (30 days): <b>{}</b>\n\n", stats.active_month));

    out.push_str("🎯 <b>Segments</b>\n");
    for (label, n) in &stats.segment_sizes {
        let title = Segment::parse_strict(label).map(Segment::title).unwrap_or(*label);
        out.push_str(&format!("• {title}: <b>{n}</b>\n"));
    }

    let c = &stats.campaigns;
    out.push_str("\n📢 <b>Broadcasts</b>\n");
    out.push_str(&format!("• Delivered: <b>{}</b>\n", c.delivered));
    out.push_str(&format!("• Messages sent: <b>{}</b>\n", c.total_sent));
    out.push_str(&format!("• Failed: <b>{}</b>\n", c.total_failed));
    out.push_str(&format!("• Scheduled: <b>{}</b>\n\n", c.pending_scheduled));

    out.push_str("💡 <b>Metrics</b>\n");
    out.push_str(&format!("• Active rate: <b>{:.1}%</b>\n", stats.active_rate()));
    out.push_str(&format!(
        "• Average per broadcast: <b>{}</b>",
        stats.avg_sent_per_campaign()
    ));
    out
}

/// Plain-text export of the counters and the per-day registrations.
pub fn export_text(store: &Store) -> Result<String> {
    export_text_at(store, Utc::now())
}

pub fn export_text_at(store: &Store, now: DateTime<Utc>) -> Result<String> {
    let stats = detailed_stats_at(store, now)?;
    let days = store.registrations_by_day_at(GROWTH_DAYS, now)?;

    let mut lines = vec![
        format!("exported_at,{}", now.format("%Y-%m-%d %H:%M:%S")),
        format!("total_users,{}", stats.total_users),
        format!("blocked_users,{}", stats.blocked_users),
        format!("new_today,{}", stats.new_today),
        format!("new_week,{}", stats.new_week),
        format!("new_month,{}", stats.new_month),
        format!("active_month,{}", stats.active_month),
    ];
    for (label, n) in &stats.segment_sizes {
        lines.push(format!("segment_{label},{n}"));
    }
    lines.push(format!("campaigns_delivered,{}", stats.campaigns.delivered));
    lines.push(format!("messages_sent,{}", stats.campaigns.total_sent));
    lines.push(format!("messages_failed,{}", stats.campaigns.total_failed));
    lines.push(format!("campaigns_scheduled,{}", stats.campaigns.pending_scheduled));
    lines.push(String::new());
    lines.push("date,registrations".to_string());
    for d in days.iter().rev() {
        lines.push(format!("{},{}", d.day.format("%Y-%m-%d"), d.count));
    }
    Ok(lines.join("\n"))
}
