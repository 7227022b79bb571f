//! In-memory messenger used by unit tests across the crate.

use std::{collections::HashSet, sync::Mutex};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Html {
        chat_id: ChatId,
        html: String,
    },
    Keyboard {
        chat_id: ChatId,
        html: String,
        keyboard: InlineKeyboard,
    },
    Photo {
        chat_id: ChatId,
        photo: String,
        caption: Option<String>,
        keyboard: Option<InlineKeyboard>,
    },
}

impl Sent {
    pub fn chat_id(&self) -> ChatId {
        match self {
            Sent::Html { chat_id, .. }
            | Sent::Keyboard { chat_id, .. }
            | Sent::Photo { chat_id, .. } => *chat_id,
        }
    }
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    failing: Mutex<HashSet<i64>>,
    fail_edits: Mutex<bool>,
    pub sends: Mutex<Vec<Sent>>,
    pub edits: Mutex<Vec<(MessageRef, String)>>,
    pub edit_keyboards: Mutex<Vec<InlineKeyboard>>,
    pub callbacks: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            ..Default::default()
        }
    }

    /// Every send to `chat_id` fails, as if the user blocked the bot.
    pub fn fail_for(self, chat_id: i64) -> Self {
        self.failing.lock().unwrap().insert(chat_id);
        self
    }

    pub fn failing_edits(self) -> Self {
        *self.fail_edits.lock().unwrap() = true;
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<i64> {
        self.sent().iter().map(|s| s.chat_id().0).collect()
    }

    pub fn edited(&self) -> Vec<String> {
        self.edits
            .lock()
            .unwrap()
            .iter()
            .map(|(_, html)| html.clone())
            .collect()
    }

    pub fn edited_keyboards(&self) -> Vec<InlineKeyboard> {
        self.edit_keyboards.lock().unwrap().clone()
    }

    fn record(&self, sent: Sent) -> Result<MessageRef> {
        let chat_id = sent.chat_id();
        if self.failing.lock().unwrap().contains(&chat_id.0) {
            return Err(Error::External(format!(
                "Forbidden: bot was blocked by the user {}",
                chat_id.0
            )));
        }
        self.sends.lock().unwrap().push(sent);
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(id),
        })
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_edit: true,
            supports_photos: true,
            supports_inline_keyboards: true,
            max_message_len: 4096,
            max_caption_len: 1024,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.record(Sent::Html {
            chat_id,
            html: html.to_string(),
        })
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.record(Sent::Keyboard {
            chat_id,
            html: html.to_string(),
            keyboard,
        })
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.record(Sent::Photo {
            chat_id,
            photo: photo.to_string(),
            caption: caption.map(str::to_string),
            keyboard,
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        if *self.fail_edits.lock().unwrap() {
            return Err(Error::External("message is not modified".to_string()));
        }
        self.edits.lock().unwrap().push((msg, html.to_string()));
        Ok(())
    }

    async fn edit_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        self.edit_html(msg, html).await?;
        self.edit_keyboards.lock().unwrap().push(keyboard);
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.callbacks
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}
