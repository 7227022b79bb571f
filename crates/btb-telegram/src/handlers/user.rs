//! Public bot: registers recipients and points them to the web app.

use std::sync::Arc;

use teloxide::{prelude::*, types::User};

use btb_core::{
    domain::{ChatId, UserId},
    formatting::escape_html,
    store::recipients::Profile,
};

use crate::router::AppState;

use super::{commands::parse_command, keyboards};

const WELCOME: &str = "👋 <b>Welcome!</b>\n\n\
Tap the button below to open the app.";

const HELP: &str = "📖 <b>Commands:</b>\n\n\
/start - Start the bot\n\
/help - Show this help\n\n\
Use the menu button to open the app.";

const HINT: &str = "👋 Use /start to begin.\n\nOr tap the menu button to open the app.";

fn profile(user: &User) -> Profile {
    Profile {
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()).filter(|s| !s.is_empty()),
        last_name: user.last_name.clone(),
    }
}

/// `/start <payload>` deep-link parameter, if any.
fn start_payload(arg: &str) -> Option<&str> {
    arg.split_whitespace().next()
}

fn new_user_html(
    id: UserId,
    name: &str,
    username: Option<&str>,
    referral: Option<&str>,
    total: u64,
) -> String {
    let mut out = format!(
        "🆕 <b>New user!</b>\n\n👤 <b>ID:</b> <code>{id}</code>\n📛 <b>Name:</b> {}\n",
        escape_html(name)
    );
    if let Some(u) = username {
        out.push_str(&format!("🔗 <b>Username:</b> @{}\n", escape_html(u)));
    }
    if let Some(r) = referral {
        out.push_str(&format!("🔑 <b>Start parameter:</b> <code>{}</code>\n", escape_html(r)));
    }
    out.push_str(&format!("\n📊 <b>Total users:</b> {total}"));
    out
}

pub async fn handle_user_message(
    _bot: Bot,
    msg: Message,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(messenger) = state.user.clone() else {
        return Ok(());
    };
    let chat = ChatId(msg.chat.id.0);
    let id = UserId(user.id.0 as i64);

    let (cmd, arg) = match msg.text() {
        Some(text) if text.starts_with('/') => parse_command(text),
        _ => (String::new(), String::new()),
    };

    if cmd == "start" {
        let referral = start_payload(&arg);
        let is_new = match state.store.upsert(id, &profile(user), referral) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(user = id.0, "failed to register user: {e}");
                false
            }
        };

        if let Err(e) = messenger
            .send_keyboard(chat, WELCOME, keyboards::web_app(&state.cfg.web_app_url))
            .await
        {
            tracing::warn!(user = id.0, "failed to send welcome: {e}");
        }

        if is_new {
            tracing::info!(user = id.0, referral, "new user registered");
            notify_admins(&state, user, referral).await;
        } else {
            tracing::info!(user = id.0, "user returned");
        }
        return Ok(());
    }

    // Any later contact counts as activity, /help included.
    if let Err(e) = state.store.upsert(id, &profile(user), None) {
        tracing::error!(user = id.0, "failed to record activity: {e}");
    }
    let _ = messenger.send_html(chat, reply_for(&cmd)).await;
    Ok(())
}

/// Answer to anything but `/start`.
fn reply_for(cmd: &str) -> &'static str {
    match cmd {
        "help" => HELP,
        _ => HINT,
    }
}

async fn notify_admins(state: &AppState, user: &User, referral: Option<&str>) {
    let Some(chat) = state.cfg.admin_chat_id else {
        tracing::debug!("ADMIN_BOT_CHAT_ID is not set, skipping new-user notification");
        return;
    };
    let total = state.store.count(true).unwrap_or_default();
    let html = new_user_html(
        UserId(user.id.0 as i64),
        &user.full_name(),
        user.username.as_deref(),
        referral,
        total,
    );
    if let Err(e) = state.admin.send_html(ChatId(chat), &html).await {
        tracing::warn!("new-user notification failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_and_other_messages_get_their_replies() {
        assert_eq!(reply_for("help"), HELP);
        assert_eq!(reply_for("settings"), HINT);
        assert_eq!(reply_for(""), HINT);
    }

    #[test]
    fn start_payload_is_first_token() {
        assert_eq!(start_payload("promo_42 extra"), Some("promo_42"));
        assert_eq!(start_payload("   "), None);
    }

    #[test]
    fn new_user_notice_escapes_and_lists_referral() {
        let html = new_user_html(UserId(42), "Ann <3 Lee", Some("ann"), Some("ads"), 10);
        assert!(html.contains("<code>42</code>"));
        assert!(html.contains("Ann &lt;3 Lee"));
        assert!(html.contains("@ann"));
        assert!(html.contains("<code>ads</code>"));
        assert!(html.ends_with("10"));

        let html = new_user_html(UserId(7), "Bob", None, None, 1);
        assert!(!html.contains("Username"));
        assert!(!html.contains("Start parameter"));
    }
}
