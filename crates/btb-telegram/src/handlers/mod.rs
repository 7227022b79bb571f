//! Telegram update handlers.
//!
//! The admin bot gets commands, callback buttons and compose input from
//! operators. The user bot only registers people and answers /start and /help.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use btb_core::{
    domain::{ChatId, MessageRef, UserId},
    errors::Error,
    formatting::escape_html,
    messaging::types::InlineKeyboard,
    security::is_authorized,
};

use crate::router::AppState;

mod callback;
mod commands;
mod compose;
mod keyboards;
mod reply;
mod user;

pub use user::handle_user_message;

/// Operator context shared by the admin-side handlers.
pub(crate) struct Ctx {
    pub state: Arc<AppState>,
    pub chat: ChatId,
    pub operator: UserId,
}

impl Ctx {
    pub async fn send(&self, html: &str) -> Option<MessageRef> {
        match self.state.admin.send_html(self.chat, html).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(chat = self.chat.0, "failed to reply: {e}");
                None
            }
        }
    }

    pub async fn send_kb(&self, html: &str, keyboard: InlineKeyboard) -> Option<MessageRef> {
        if keyboard.is_empty() {
            return self.send(html).await;
        }
        match self.state.admin.send_keyboard(self.chat, html, keyboard).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(chat = self.chat.0, "failed to reply: {e}");
                None
            }
        }
    }

    /// Long listings; split on line boundaries.
    pub async fn send_long(&self, html: &str) {
        for chunk in reply::split_lines(html, reply::SAFE_LIMIT) {
            self.send(&chunk).await;
        }
    }

    pub async fn fail(&self, err: &Error) {
        if err.is_rejection() {
            tracing::debug!(operator = self.operator.0, "rejected: {err}");
        } else {
            tracing::error!(operator = self.operator.0, "operation failed: {err}");
        }
        self.send(&error_html(err)).await;
    }
}

/// Operator-facing text for a core error.
pub(crate) fn error_html(err: &Error) -> String {
    match err {
        Error::InvalidInput(m) | Error::NotFound(m) => format!("⚠️ {}", escape_html(m)),
        Error::TransportNotConfigured => {
            "⚠️ Broadcasting is disabled: USER_BOT_TOKEN is not configured.".to_string()
        }
        Error::Cancelled { processed, total } => {
            format!("⏹ Broadcast cancelled after {processed}/{total} recipients.")
        }
        other => format!("❌ Error: {}", escape_html(&other.to_string())),
    }
}

fn authorized(state: &AppState, user: Option<&teloxide::types::User>) -> Option<UserId> {
    let id = user.map(|u| UserId(u.id.0 as i64));
    is_authorized(id, &state.cfg.admin_ids).then_some(id).flatten()
}

pub async fn handle_admin_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_admin_message(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let Some(operator) = authorized(&state, msg.from()) else {
        let _ = state
            .admin
            .send_html(ChatId(msg.chat.id.0), "⛔ Access denied.")
            .await;
        return Ok(());
    };

    let ctx = Ctx {
        state,
        chat: ChatId(msg.chat.id.0),
        operator,
    };

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(&ctx, text).await;
        }
    }

    compose::handle_input(&ctx, &bot, &msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_read_as_warnings() {
        assert_eq!(
            error_html(&Error::InvalidInput("name <too> short".to_string())),
            "⚠️ name &lt;too&gt; short"
        );
        assert!(error_html(&Error::TransportNotConfigured).contains("USER_BOT_TOKEN"));
        assert_eq!(
            error_html(&Error::Cancelled {
                processed: 3,
                total: 10
            }),
            "⏹ Broadcast cancelled after 3/10 recipients."
        );
        assert!(error_html(&Error::External("boom".to_string())).starts_with("❌ Error:"));
    }
}
