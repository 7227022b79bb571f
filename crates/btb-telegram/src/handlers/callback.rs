use std::sync::Arc;

use teloxide::prelude::*;

use btb_core::{
    compose::{ComposeInput, ComposeMode, ComposeState},
    domain::{ChatId, MessageId, MessageRef, TemplateId, UserId},
    formatting::recipient_card_html,
    messaging::types::InlineKeyboard,
    segment::Segment,
    store::recipients::Recipient,
};

use crate::router::AppState;

use super::{authorized, commands, compose, keyboards, Ctx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MenuItem {
    Stats,
    Broadcast,
    Schedule,
    Templates,
    Users,
    History,
}

/// Parsed inline-button payload of the admin bot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallbackAction {
    Menu(MenuItem),
    /// `segment_*` and `sched_segment_*`; the compose state knows the mode.
    Segment(Segment),
    TemplateUse(TemplateId),
    TemplateDeleteMenu,
    TemplateDelete(TemplateId),
    UserToggle(UserId),
    UserInfo(UserId),
    AnalyticsDetailed,
    AnalyticsGrowth,
    AnalyticsExport,
    HistoryDetailed,
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Self {
        let id = |s: &str| s.parse::<i64>().ok();

        if let Some(item) = data.strip_prefix("menu_") {
            return match item {
                "stats" => Self::Menu(MenuItem::Stats),
                "broadcast" => Self::Menu(MenuItem::Broadcast),
                "schedule" => Self::Menu(MenuItem::Schedule),
                "templates" => Self::Menu(MenuItem::Templates),
                "users" => Self::Menu(MenuItem::Users),
                "history" => Self::Menu(MenuItem::History),
                _ => Self::Unknown,
            };
        }
        if let Some(label) = data
            .strip_prefix("sched_segment_")
            .or_else(|| data.strip_prefix("segment_"))
        {
            return Self::Segment(Segment::parse(label));
        }
        if data == "template_delete_menu" {
            return Self::TemplateDeleteMenu;
        }
        if let Some(rest) = data.strip_prefix("template_delete_") {
            return id(rest).map(|n| Self::TemplateDelete(TemplateId(n))).unwrap_or(Self::Unknown);
        }
        if let Some(rest) = data.strip_prefix("template_use_") {
            return id(rest).map(|n| Self::TemplateUse(TemplateId(n))).unwrap_or(Self::Unknown);
        }
        if let Some(rest) = data.strip_prefix("user_toggle_") {
            return id(rest).map(|n| Self::UserToggle(UserId(n))).unwrap_or(Self::Unknown);
        }
        if let Some(rest) = data.strip_prefix("user_info_") {
            return id(rest).map(|n| Self::UserInfo(UserId(n))).unwrap_or(Self::Unknown);
        }
        match data {
            "analytics_detailed" => Self::AnalyticsDetailed,
            "analytics_growth" => Self::AnalyticsGrowth,
            "analytics_export" => Self::AnalyticsExport,
            "history_detailed" => Self::HistoryDetailed,
            _ => Self::Unknown,
        }
    }
}

pub async fn handle_callback(
    _bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let data = q.data.clone().unwrap_or_default();
    let origin = q.message.as_ref().map(|m| MessageRef {
        chat_id: ChatId(m.chat.id.0),
        message_id: MessageId(m.id.0),
    });

    // Always answer callback query eventually.
    let Some(origin) = origin.filter(|_| !data.is_empty()) else {
        let _ = state.admin.answer_callback_query(&cb_id, None).await;
        return Ok(());
    };

    let Some(operator) = authorized(&state, Some(&q.from)) else {
        let _ = state
            .admin
            .answer_callback_query(&cb_id, Some("Access denied"))
            .await;
        return Ok(());
    };

    let ctx = Ctx {
        state,
        chat: origin.chat_id,
        operator,
    };
    let action = CallbackAction::parse(&data);
    tracing::debug!(operator = operator.0, ?action, "callback");

    // Short notice shown as a toast; `None` just stops the spinner.
    let notice = run(&ctx, action, origin).await;
    let _ = ctx
        .state
        .admin
        .answer_callback_query(&cb_id, notice.as_deref())
        .await;
    Ok(())
}

async fn run(ctx: &Ctx, action: CallbackAction, origin: MessageRef) -> Option<String> {
    match action {
        CallbackAction::Menu(item) => {
            match item {
                MenuItem::Stats => commands::show_stats(ctx).await,
                MenuItem::Broadcast => commands::begin_compose(ctx, ComposeMode::Immediate).await,
                MenuItem::Schedule => commands::begin_compose(ctx, ComposeMode::Scheduled).await,
                MenuItem::Templates => commands::show_templates(ctx).await,
                MenuItem::Users => commands::show_users(ctx, "").await,
                MenuItem::History => commands::show_history(ctx, false).await,
            }
            None
        }

        CallbackAction::Segment(segment) => {
            let step = ctx
                .state
                .sessions
                .handle(ctx.operator, ComposeInput::SegmentChosen(segment))
                .await;
            compose::render(ctx, step).await;
            Some(segment.title().to_string())
        }

        CallbackAction::TemplateUse(id) => {
            if !ctx.state.broadcast.is_enabled() {
                ctx.fail(&btb_core::Error::TransportNotConfigured).await;
                return None;
            }
            match ctx.state.broadcast.instantiate_template(id, ctx.operator) {
                Ok(draft) => {
                    ctx.state
                        .sessions
                        .begin(
                            ctx.operator,
                            ComposeState::AwaitingSegment {
                                mode: ComposeMode::Immediate,
                                draft,
                            },
                        )
                        .await;
                    ctx.send_kb(
                        "📋 Template loaded.\n\n🎯 Choose the audience:",
                        keyboards::segments(ComposeMode::Immediate),
                    )
                    .await;
                    None
                }
                Err(e) => {
                    ctx.fail(&e).await;
                    None
                }
            }
        }

        CallbackAction::TemplateDeleteMenu => {
            match ctx.state.store.list_templates(ctx.operator) {
                Ok(list) if list.is_empty() => {
                    ctx.send("📋 No templates to delete.").await;
                }
                Ok(list) => {
                    ctx.send_kb(
                        "🗑 <b>Which template should be deleted?</b>",
                        keyboards::template_delete(&list),
                    )
                    .await;
                }
                Err(e) => ctx.fail(&e).await,
            }
            None
        }

        CallbackAction::TemplateDelete(id) => {
            match ctx.state.store.delete_template(id, ctx.operator) {
                Ok(true) => {
                    tracing::info!(operator = ctx.operator.0, template = id.0, "template deleted");
                    let _ = ctx
                        .state
                        .admin
                        .edit_html(origin, &format!("🗑 Template {id} deleted."))
                        .await;
                    Some("Deleted".to_string())
                }
                Ok(false) => Some("Template not found".to_string()),
                Err(e) => {
                    ctx.fail(&e).await;
                    None
                }
            }
        }

        CallbackAction::UserInfo(id) => {
            match ctx.state.store.get_recipient(id) {
                Ok(Some(r)) => {
                    let (html, kb) = card(&r);
                    ctx.send_kb(&html, kb).await;
                    None
                }
                Ok(None) => Some("User not found".to_string()),
                Err(e) => {
                    ctx.fail(&e).await;
                    None
                }
            }
        }

        CallbackAction::UserToggle(id) => match ctx.state.store.toggle_active(id) {
            Ok(Some(active)) => {
                tracing::info!(operator = ctx.operator.0, user = id.0, active, "recipient toggled");
                if let Ok(Some(r)) = ctx.state.store.get_recipient(id) {
                    let (html, kb) = card(&r);
                    if let Err(e) = ctx.state.admin.edit_keyboard(origin, &html, kb).await {
                        tracing::debug!(user = id.0, "card refresh failed: {e}");
                    }
                }
                Some(if active { "Unblocked" } else { "Blocked" }.to_string())
            }
            Ok(None) => Some("User not found".to_string()),
            Err(e) => {
                ctx.fail(&e).await;
                None
            }
        },

        CallbackAction::AnalyticsDetailed => {
            commands::show_analytics(ctx).await;
            None
        }
        CallbackAction::AnalyticsGrowth => {
            commands::show_growth(ctx).await;
            None
        }
        CallbackAction::AnalyticsExport => {
            commands::export(ctx).await;
            None
        }
        CallbackAction::HistoryDetailed => {
            commands::show_history(ctx, true).await;
            None
        }

        CallbackAction::Unknown => Some("Unknown action".to_string()),
    }
}

/// Recipient card with its block/unblock button.
fn card(r: &Recipient) -> (String, InlineKeyboard) {
    (recipient_card_html(r), keyboards::user_card(r))
}
