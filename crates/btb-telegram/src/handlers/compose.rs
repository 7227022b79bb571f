//! Operator input inside a compose flow, and rendering of compose steps.

use std::sync::atomic::{AtomicU64, Ordering};

use teloxide::{net::Download, prelude::*, types::PhotoSize};

use tokio_util::sync::CancellationToken;

use btb_core::{
    broadcast::Submitted,
    campaign::{CampaignContent, CampaignPayload},
    compose::{ComposeInput, Step},
    dispatch::{MessageProgress, NoProgress},
    formatting::{escape_html, local_time, outcome_html, progress_html, truncate_text},
    messaging::types::InlineKeyboard,
    segment::{self, Segment},
};

use super::{commands::schedule_hint, error_html, keyboards, Ctx};

static PHOTO_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) async fn handle_input(ctx: &Ctx, bot: &Bot, msg: &Message) -> ResponseResult<()> {
    if ctx.state.sessions.get(ctx.operator).await.is_none() {
        ctx.send("Nothing is in progress. Use /start to open the menu.")
            .await;
        return Ok(());
    }

    let html = msg.text().or(msg.caption()).unwrap_or("").to_string();
    let image_ref = match msg.photo() {
        Some(photos) => match download_photo(ctx, bot, msg, photos).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(operator = ctx.operator.0, "photo download failed: {e}");
                ctx.send("❌ Could not download the photo. Please try again.")
                    .await;
                return Ok(());
            }
        },
        None => None,
    };

    let step = ctx
        .state
        .sessions
        .handle(ctx.operator, ComposeInput::Message { html, image_ref })
        .await;
    render(ctx, step).await;
    Ok(())
}

/// Telegram file ids are bot-scoped, so photos are stored locally and the
/// user bot uploads them again.
async fn download_photo(
    ctx: &Ctx,
    bot: &Bot,
    msg: &Message,
    photos: &[PhotoSize],
) -> anyhow::Result<String> {
    let best = photos
        .last()
        .ok_or_else(|| anyhow::anyhow!("no photo sizes"))?;
    let file = bot.get_file(best.file.id.clone()).await?;

    let n = PHOTO_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = ctx.state.cfg.media_dir.join(format!(
        "broadcast_{}_{}_{n}.jpg",
        ctx.operator.0, msg.id.0
    ));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;

    let path = std::fs::canonicalize(&path).unwrap_or(path);
    Ok(path.to_string_lossy().to_string())
}

pub(crate) async fn render(ctx: &Ctx, step: Step) {
    match step {
        Step::Idle => {
            ctx.send("Nothing is in progress. Use /start to open the menu.")
                .await;
        }
        Step::AskSegment { mode } => {
            ctx.send_kb("🎯 Choose the audience:", keyboards::segments(mode))
                .await;
        }
        Step::AskButtons { segment, .. } => {
            let body = format!(
                "🎯 Segment: <b>{}</b>\n👥 Recipients now: <b>{}</b>\n\n\
                 🔘 Add link buttons? Reply <b>yes</b> to add them or <b>no</b> to skip.\n\
                 You can also send the buttons right away.",
                segment.title(),
                audience_size(ctx, segment)
            );
            ctx.send(&body).await;
        }
        Step::ButtonHelp => {
            ctx.send(
                "🔘 Send buttons one per line:\n\n\
                 <code>Website | https://example.com</code>\n\
                 <code>Channel | https://t.me/example</code>",
            )
            .await;
        }
        Step::ButtonsNotRecognized => {
            ctx.send(
                "⚠️ No buttons recognized. Use <code>Label | https://...</code>, \
                 or reply <b>no</b> to skip.",
            )
            .await;
        }
        Step::AskScheduleTime => {
            let body = format!("⏰ When should it go out? Send {}", schedule_hint());
            ctx.send(&body).await;
        }
        Step::Preview(payload) => preview(ctx, &payload).await,
        Step::Submit(payload) => submit(ctx, payload).await,
        Step::Cancelled => {
            ctx.send("❌ Broadcast cancelled.").await;
        }
        Step::SaveTemplate { campaign_id, name } => {
            match ctx
                .state
                .broadcast
                .save_template_from(ctx.operator, campaign_id, &name)
            {
                Ok(id) => {
                    let body = format!(
                        "✅ Template <b>{}</b> saved ({id}). Find it in /templates.",
                        escape_html(&name)
                    );
                    ctx.send(&body).await;
                }
                Err(e) => ctx.fail(&e).await,
            }
        }
        Step::SearchUsers(query) => search_users(ctx, &query).await,
        Step::Rejected(reason) => {
            ctx.send(&format!("⚠️ {}", escape_html(&reason))).await;
        }
    }
}

fn audience_size(ctx: &Ctx, segment: Segment) -> usize {
    segment::resolve(&ctx.state.store, segment)
        .map(|r| r.len())
        .unwrap_or_default()
}

/// Show the content exactly as recipients will get it, then ask to confirm.
async fn preview(ctx: &Ctx, payload: &CampaignPayload) {
    let content = &payload.content;
    if let Err(e) = send_content(ctx, content).await {
        ctx.state.sessions.cancel(ctx.operator).await;
        let body = format!(
            "❌ Telegram rejected the preview: {}\n\nFix the message and start again.",
            escape_html(&e.to_string())
        );
        ctx.send(&body).await;
        return;
    }

    let mut body = format!(
        "📋 <b>Preview above</b>\n\n🎯 Segment: <b>{}</b>\n👥 Recipients now: <b>{}</b>\n",
        payload.segment.title(),
        audience_size(ctx, payload.segment)
    );
    if !content.buttons.is_empty() {
        body.push_str(&format!("🔘 Buttons: {}\n", content.buttons.len()));
    }
    if let Some(at) = payload.scheduled_at {
        body.push_str(&format!("⏰ Send at: <b>{}</b>\n", local_time(at)));
    }
    body.push_str("\nReply <b>yes</b> to confirm, anything else cancels.");
    ctx.send(&body).await;
}

async fn send_content(ctx: &Ctx, content: &CampaignContent) -> btb_core::Result<()> {
    let keyboard = InlineKeyboard::from_links(&content.buttons);
    let admin = &ctx.state.admin;
    match (&content.image_ref, keyboard) {
        (Some(image), kb) => {
            let caption = content.has_text().then_some(content.text.as_str());
            admin.send_photo(ctx.chat, image, caption, kb).await?;
        }
        (None, Some(kb)) => {
            admin.send_keyboard(ctx.chat, &content.text, kb).await?;
        }
        (None, None) => {
            admin.send_html(ctx.chat, &content.text).await?;
        }
    }
    Ok(())
}

fn submitted_html(submitted: &Submitted, segment: Segment) -> String {
    match submitted {
        Submitted::Delivered {
            campaign_id,
            outcome,
        } => format!(
            "{}\n\n📨 Broadcast {campaign_id} · {}",
            outcome_html(*outcome),
            segment.title()
        ),
        Submitted::Scheduled { campaign_id, at } => format!(
            "✅ Broadcast {campaign_id} scheduled for <b>{}</b>\n\
             🎯 Segment: {}\n\nSee /scheduled.",
            local_time(*at),
            segment.title()
        ),
    }
}

async fn submit(ctx: &Ctx, payload: CampaignPayload) {
    let operator = ctx.operator;

    if payload.scheduled_at.is_some() {
        let result = ctx
            .state
            .broadcast
            .submit(operator, &payload, &NoProgress, &CancellationToken::new())
            .await;
        match result {
            Ok(s) => {
                ctx.send(&submitted_html(&s, payload.segment)).await;
            }
            Err(e) => ctx.fail(&e).await,
        }
        return;
    }

    let Some(run) = ctx.state.running.begin(operator, &ctx.state.shutdown).await else {
        ctx.send("⚠️ A broadcast is already running. /cancel stops it.")
            .await;
        return;
    };

    let total = audience_size(ctx, payload.segment);
    let Some(progress_msg) = ctx.send(&progress_html(0, total, 0, 0)).await else {
        ctx.state.running.finish(&run).await;
        return;
    };

    // Long sends run off the update loop so /cancel still gets through.
    let state = ctx.state.clone();
    let chat = ctx.chat;
    tokio::spawn(async move {
        let sink = MessageProgress::new(state.admin.clone(), progress_msg);
        let result = state
            .broadcast
            .submit(operator, &payload, &sink, &run.token)
            .await;
        sink.finish().await;
        state.running.finish(&run).await;

        let html = match &result {
            Ok(s) => submitted_html(s, payload.segment),
            Err(e) => {
                tracing::warn!(operator = operator.0, "broadcast ended with error: {e}");
                error_html(e)
            }
        };
        if state.admin.edit_html(progress_msg, &html).await.is_err() {
            let _ = state.admin.send_html(chat, &html).await;
        }
    });
}

pub(crate) async fn search_users(ctx: &Ctx, query: &str) {
    let found = match ctx.state.store.search(query) {
        Ok(f) => f,
        Err(e) => return ctx.fail(&e).await,
    };
    if found.is_empty() {
        let body = format!("🔍 Nobody found for <code>{}</code>.", escape_html(query.trim()));
        ctx.send(&body).await;
        return;
    }

    let lines: Vec<String> = found
        .iter()
        .map(|r| {
            let status = if r.active { "✅" } else { "🚫" };
            let username = r
                .username
                .as_deref()
                .map(|u| format!(" @{}", escape_html(u)))
                .unwrap_or_default();
            format!(
                "{status} {}{username} · <code>{}</code>",
                escape_html(&truncate_text(&r.display_name(), 40)),
                r.id
            )
        })
        .collect();
    let body = format!("🔍 <b>Found {}</b>\n\n{}", found.len(), lines.join("\n"));
    ctx.send_kb(&body, keyboards::user_results(&found)).await;
}
