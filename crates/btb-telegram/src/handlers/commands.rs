use chrono::Utc;
use teloxide::prelude::*;

use btb_core::{
    analytics::{self, GROWTH_DAYS},
    broadcast::MIN_TEMPLATE_NAME_LEN,
    campaign::SCHEDULE_FORMAT,
    compose::{ComposeMode, ComposeState},
    formatting::{campaign_line_html, escape_html, template_preview_html},
    Error,
};

use super::{
    compose, keyboards,
    reply::{split_lines, SAFE_LIMIT},
    Ctx,
};

/// How many campaigns `/history` lists.
const HISTORY_LEN: usize = 10;
const HISTORY_DETAILED_LEN: usize = 30;

pub(crate) fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

const HELP: &str = "📖 <b>Broadcast admin</b>\n\n\
<b>📋 Commands:</b>\n\
/start - Main menu\n\
/stats - Quick statistics\n\
/analytics - Detailed analytics\n\
/broadcast - Send a broadcast now\n\
/schedule - Schedule a broadcast\n\
/scheduled - Upcoming scheduled broadcasts\n\
/templates - Saved templates\n\
/template_save - Save your last broadcast as a template\n\
/users [query] - Find users by id, @username or name\n\
/history - Recent broadcasts\n\
/cancel - Cancel the current action or running broadcast\n\n\
<b>💡 Tips:</b>\n\
• Broadcast text is sent as HTML: &lt;b&gt;, &lt;i&gt;, &lt;a href&gt;...\n\
• Send a photo with a caption to broadcast an image\n\
• Buttons: one per line, <code>Label | https://example.com</code>";

pub async fn handle_command(ctx: &Ctx, text: &str) -> ResponseResult<()> {
    let (cmd, arg) = parse_command(text);
    tracing::debug!(operator = ctx.operator.0, %cmd, "admin command");

    match cmd.as_str() {
        "start" => show_menu(ctx).await,
        "help" => {
            ctx.send(HELP).await;
        }
        "stats" => show_stats(ctx).await,
        "analytics" => show_analytics(ctx).await,
        "broadcast" => begin_compose(ctx, ComposeMode::Immediate).await,
        "schedule" => begin_compose(ctx, ComposeMode::Scheduled).await,
        "scheduled" => show_scheduled(ctx).await,
        "templates" => show_templates(ctx).await,
        "template_save" => begin_template_save(ctx).await,
        "users" => show_users(ctx, &arg).await,
        "history" => show_history(ctx, false).await,
        "cancel" => cancel(ctx).await,
        _ => {
            let msg = format!("Unknown command: /{}. See /help.", escape_html(&cmd));
            ctx.send(&msg).await;
        }
    }
    Ok(())
}

pub(crate) async fn show_menu(ctx: &Ctx) {
    let enabled = if ctx.state.broadcast.is_enabled() {
        "✅ Broadcasting is enabled"
    } else {
        "⚠️ Broadcasting is disabled (no user bot token)"
    };
    let body = format!("👋 <b>Broadcast admin</b>\n\n{enabled}\n\nChoose an action:");
    ctx.send_kb(&body, keyboards::main_menu()).await;
}

pub(crate) async fn show_stats(ctx: &Ctx) {
    let stats = match analytics::detailed_stats(&ctx.state.store) {
        Ok(s) => s,
        Err(e) => return ctx.fail(&e).await,
    };
    let body = format!(
        "📊 <b>Statistics</b>\n\n\
         👥 Users: <b>{}</b>\n🚫 Blocked: <b>{}</b>\n\
         🆕 New this week: <b>{}</b>\n✅ Active (30 days): <b>{}</b>\n\n\
         📢 Broadcasts delivered: <b>{}</b>\n⏰ Scheduled: <b>{}</b>",
        stats.total_users,
        stats.blocked_users,
        stats.new_week,
        stats.active_month,
        stats.campaigns.delivered,
        stats.campaigns.pending_scheduled,
    );
    ctx.send_kb(&body, keyboards::analytics()).await;
}

pub(crate) async fn show_analytics(ctx: &Ctx) {
    match analytics::detailed_stats(&ctx.state.store) {
        Ok(stats) => {
            ctx.send_kb(&analytics::summary_html(&stats), keyboards::analytics())
                .await;
        }
        Err(e) => ctx.fail(&e).await,
    }
}

pub(crate) async fn show_growth(ctx: &Ctx) {
    match analytics::growth_report(&ctx.state.store, GROWTH_DAYS) {
        Ok(html) => ctx.send_long(&html).await,
        Err(e) => ctx.fail(&e).await,
    }
}

pub(crate) async fn export(ctx: &Ctx) {
    match analytics::export_text(&ctx.state.store) {
        Ok(text) => {
            ctx.send("📥 <b>Export</b>").await;
            for chunk in split_lines(&escape_html(&text), SAFE_LIMIT) {
                ctx.send(&format!("<pre>{chunk}</pre>")).await;
            }
        }
        Err(e) => ctx.fail(&e).await,
    }
}

pub(crate) async fn begin_compose(ctx: &Ctx, mode: ComposeMode) {
    if !ctx.state.broadcast.is_enabled() {
        return ctx.fail(&Error::TransportNotConfigured).await;
    }
    ctx.state
        .sessions
        .begin(ctx.operator, ComposeState::AwaitingContent { mode })
        .await;

    let title = match mode {
        ComposeMode::Immediate => "📢 <b>New broadcast</b>",
        ComposeMode::Scheduled => "⏰ <b>New scheduled broadcast</b>",
    };
    let body = format!(
        "{title}\n\nSend the message text (HTML is allowed) or a photo with a caption.\n\n\
         /cancel to abort."
    );
    ctx.send(&body).await;
}

pub(crate) async fn show_scheduled(ctx: &Ctx) {
    match ctx.state.store.list_upcoming(Utc::now()) {
        Ok(list) if list.is_empty() => {
            ctx.send("⏰ No scheduled broadcasts.").await;
        }
        Ok(list) => {
            let lines: Vec<String> = list.iter().map(campaign_line_html).collect();
            let html = format!("⏰ <b>Scheduled broadcasts</b>\n\n{}", lines.join("\n"));
            ctx.send_long(&html).await;
        }
        Err(e) => ctx.fail(&e).await,
    }
}

pub(crate) async fn show_templates(ctx: &Ctx) {
    let list = match ctx.state.store.list_templates(ctx.operator) {
        Ok(l) => l,
        Err(e) => return ctx.fail(&e).await,
    };
    if list.is_empty() {
        ctx.send("📋 No templates yet. Send a broadcast, then use /template_save.")
            .await;
        return;
    }

    let previews: Vec<String> = list.iter().map(template_preview_html).collect();
    ctx.send_long(&format!(
        "📋 <b>Your templates</b>\n\n{}",
        previews.join("\n\n")
    ))
    .await;
    ctx.send_kb("Pick a template to broadcast:", keyboards::templates(&list))
        .await;
}

pub(crate) async fn begin_template_save(ctx: &Ctx) {
    let last = match ctx.state.store.last_delivered_by(ctx.operator) {
        Ok(c) => c,
        Err(e) => return ctx.fail(&e).await,
    };
    let Some(campaign) = last else {
        ctx.send("⚠️ You have no delivered broadcasts to save yet.").await;
        return;
    };

    ctx.state
        .sessions
        .begin(
            ctx.operator,
            ComposeState::AwaitingTemplateName {
                campaign_id: campaign.id,
            },
        )
        .await;
    let body = format!(
        "💾 Saving broadcast {} as a template.\n\n\
         Send a name (at least {MIN_TEMPLATE_NAME_LEN} characters).",
        campaign.id
    );
    ctx.send(&body).await;
}

pub(crate) async fn show_users(ctx: &Ctx, query: &str) {
    if !query.trim().is_empty() {
        return compose::search_users(ctx, query).await;
    }

    let (active, all) = match (ctx.state.store.count(true), ctx.state.store.count(false)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return ctx.fail(&e).await,
    };
    ctx.state
        .sessions
        .begin(ctx.operator, ComposeState::AwaitingUserSearch)
        .await;
    let body = format!(
        "👥 <b>Users</b>\n\nActive: <b>{active}</b>\nBlocked: <b>{}</b>\n\n\
         Send an id, @username or a name to search. /cancel to abort.",
        all.saturating_sub(active)
    );
    ctx.send(&body).await;
}

pub(crate) async fn show_history(ctx: &Ctx, detailed: bool) {
    let limit = if detailed { HISTORY_DETAILED_LEN } else { HISTORY_LEN };
    let list = match ctx.state.store.list_recent(limit, detailed) {
        Ok(l) => l,
        Err(e) => return ctx.fail(&e).await,
    };
    if list.is_empty() {
        ctx.send("📜 No broadcasts yet.").await;
        return;
    }

    let lines: Vec<String> = list.iter().map(campaign_line_html).collect();
    let mut html = format!("📜 <b>Recent broadcasts</b>\n\n{}", lines.join("\n"));
    if detailed {
        if let Ok(stats) = ctx.state.store.campaign_stats() {
            html.push_str(&format!(
                "\n\n📊 Delivered: <b>{}</b> · sent <b>{}</b> · \
                 failed <b>{}</b> · scheduled <b>{}</b>",
                stats.delivered, stats.total_sent, stats.total_failed, stats.pending_scheduled
            ));
        }
        ctx.send_long(&html).await;
    } else {
        ctx.send_kb(&html, keyboards::history()).await;
    }
}

async fn cancel(ctx: &Ctx) {
    let had_draft = ctx.state.sessions.cancel(ctx.operator).await;
    let had_run = ctx.state.running.cancel(ctx.operator).await;
    let body = match (had_draft, had_run) {
        (_, true) => "⏹ Stopping the running broadcast...",
        (true, false) => "❌ Cancelled.",
        (false, false) => "Nothing to cancel.",
    };
    ctx.send(body).await;
}

/// Hint for the schedule prompt, e.g. `25.12.2026 18:30`.
pub(crate) fn schedule_hint() -> String {
    let example = (Utc::now() + chrono::Duration::hours(1))
        .with_timezone(&chrono::Local)
        .format(SCHEDULE_FORMAT)
        .to_string();
    format!("<code>DD.MM.YYYY HH:MM</code> (server time), for example <code>{example}</code>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_bot_suffix_and_args() {
        assert_eq!(
            parse_command("/users@admin_bot  @ann "),
            ("users".to_string(), "@ann".to_string())
        );
        assert_eq!(
            parse_command("/Template_Save"),
            ("template_save".to_string(), String::new())
        );
    }

    #[test]
    fn help_mentions_every_command() {
        for cmd in [
            "/start", "/stats", "/analytics", "/broadcast", "/schedule", "/scheduled",
            "/templates", "/template_save", "/users", "/history", "/cancel",
        ] {
            assert!(HELP.contains(cmd), "{cmd}");
        }
    }
}
