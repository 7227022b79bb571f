use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{InlineKeyboard, MessagingCapabilities},
    Result,
};

/// Outbound messenger port.
///
/// The dispatcher only needs `send_html` / `send_keyboard` / `send_photo`; the
/// admin front-end additionally edits progress messages and answers callbacks.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    /// Send a photo by Telegram file id / URL with an optional HTML caption.
    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef>;

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;

    /// Edit text and keep (or replace) the message's inline keyboard.
    async fn edit_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
