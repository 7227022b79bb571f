//! Telegram adapter (teloxide).
//!
//! This crate implements the `btb-core` MessagingPort over the Telegram Bot API
//! and runs the admin and user bots.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode, WebAppInfo},
};

use tokio::time::sleep;
use url::Url;

pub mod handlers;
pub mod router;

use btb_core::{
    campaign::{MAX_CAPTION_LEN, MAX_TEXT_LEN},
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ButtonAction, InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::debug!("telegram asked to retry after {d:?}");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

/// Telegram wants absolute URLs; operators often type `t.me/...`.
fn absolute_url(raw: &str) -> String {
    if raw.starts_with("t.me/") {
        format!("https://{raw}")
    } else {
        raw.to_string()
    }
}

pub fn to_markup(keyboard: InlineKeyboard) -> Result<InlineKeyboardMarkup> {
    let mut rows = Vec::with_capacity(keyboard.rows.len());
    for row in keyboard.rows {
        let mut out = Vec::with_capacity(row.len());
        for b in row {
            let button = match b.action {
                ButtonAction::Callback(data) => InlineKeyboardButton::callback(b.label, data),
                ButtonAction::Url(url) => {
                    let parsed = Url::parse(&absolute_url(&url))
                        .map_err(|e| Error::InvalidInput(format!("bad button url {url:?}: {e}")))?;
                    InlineKeyboardButton::url(b.label, parsed)
                }
                ButtonAction::WebApp(url) => {
                    let parsed = Url::parse(&url)
                        .map_err(|e| Error::InvalidInput(format!("bad web app url {url:?}: {e}")))?;
                    InlineKeyboardButton::web_app(b.label, WebAppInfo { url: parsed })
                }
            };
            out.push(button);
        }
        rows.push(out);
    }
    Ok(InlineKeyboardMarkup::new(rows))
}

/// Image references are URLs, local files (downloaded operator photos) or
/// Telegram file ids. File ids only work for the bot that received the file.
fn photo_input(photo: &str) -> InputFile {
    if photo.starts_with("http://") || photo.starts_with("https://") {
        if let Ok(url) = Url::parse(photo) {
            return InputFile::url(url);
        }
    }
    let path = Path::new(photo);
    if path.is_absolute() || path.exists() {
        return InputFile::file(path.to_path_buf());
    }
    InputFile::file_id(photo.to_string())
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_edit: true,
            supports_photos: true,
            supports_inline_keyboards: true,
            max_message_len: MAX_TEXT_LEN,
            max_caption_len: MAX_CAPTION_LEN,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let markup = to_markup(keyboard)?;

        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .reply_markup(markup.clone())
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        let markup = keyboard.map(to_markup).transpose()?;
        let input = photo_input(photo);

        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_photo(Self::tg_chat(chat_id), input.clone());
                if let Some(c) = caption {
                    req = req.caption(c.to_string()).parse_mode(ParseMode::Html);
                }
                if let Some(m) = &markup {
                    req = req.reply_markup(m.clone());
                }
                req
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .edit_message_text(
                    Self::tg_chat(msg.chat_id),
                    Self::tg_msg_id(msg.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
        })
        .await?;
        Ok(())
    }

    async fn edit_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        let markup = to_markup(keyboard)?;
        self.with_retry(|| {
            self.bot
                .edit_message_text(
                    Self::tg_chat(msg.chat_id),
                    Self::tg_msg_id(msg.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
                .reply_markup(markup.clone())
        })
        .await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btb_core::messaging::types::{InlineButton, LinkButton};
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn link_buttons_map_to_url_buttons() {
        let kb = InlineKeyboard::from_links(&[
            LinkButton {
                text: "Site".to_string(),
                url: "https://example.com/a".to_string(),
            },
            LinkButton {
                text: "Channel".to_string(),
                url: "t.me/example".to_string(),
            },
        ])
        .unwrap();

        let markup = to_markup(kb).unwrap();
        assert_eq!(markup.inline_keyboard.len(), 2);
        match &markup.inline_keyboard[1][0].kind {
            InlineKeyboardButtonKind::Url(u) => assert_eq!(u.as_str(), "https://t.me/example"),
            other => panic!("expected url button, got {other:?}"),
        }
    }

    #[test]
    fn callback_and_web_app_buttons_keep_their_kind() {
        let kb = InlineKeyboard::new(vec![vec![
            InlineButton::callback("Stats", "menu_stats"),
            InlineButton::web_app("Open", "https://example.com/app"),
        ]]);
        let markup = to_markup(kb).unwrap();
        let row = &markup.inline_keyboard[0];
        assert!(matches!(
            row[0].kind,
            InlineKeyboardButtonKind::CallbackData(ref d) if d == "menu_stats"
        ));
        assert!(matches!(row[1].kind, InlineKeyboardButtonKind::WebApp(_)));
    }

    #[test]
    fn unparseable_url_is_rejected() {
        let kb = InlineKeyboard::one_per_row(vec![InlineButton::url("Bad", "not a url")]);
        assert!(matches!(to_markup(kb), Err(Error::InvalidInput(_))));
    }
}
