use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* Telegram API calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Idle per-chat limiters are dropped once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// MessagingPort decorator that rate-limits outbound calls.
///
/// Broadcast fan-out touches every chat once, so the global limiter does most of
/// the work there; the per-chat limiter protects progress-message edits in the
/// operator's chat.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, IntervalLimiter>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn reserve_chat(&self, chat_id: i64) -> Duration {
        let mut map = self.per_chat.lock().await;
        if map.len() >= PRUNE_THRESHOLD && !map.contains_key(&chat_id) {
            // A limiter whose slot has passed behaves like a fresh one.
            let now = Instant::now();
            map.retain(|_, lim| lim.next > now);
        }
        map.entry(chat_id)
            .or_insert_with(|| IntervalLimiter::new(self.cfg.per_chat_min_interval))
            .reserve()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = self.reserve_chat(chat_id).await;

        let wait = global_wait.max(chat_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_keyboard(chat_id, html, keyboard).await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_photo(chat_id, photo, caption, keyboard).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.edit_html(msg, html).await
    }

    async fn edit_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.edit_keyboard(msg, html, keyboard).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // No chat_id available here; apply global throttling only.
        self.throttle_global().await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{fake::FakeMessenger, types::InlineButton};

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_consecutive_reservations() {
        let mut lim = IntervalLimiter::new(Duration::from_millis(100));
        assert_eq!(lim.reserve(), Duration::ZERO);
        assert_eq!(lim.reserve(), Duration::from_millis(100));
        assert_eq!(lim.reserve(), Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(lim.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn keyboard_edits_reach_the_inner_messenger() {
        let fake = Arc::new(FakeMessenger::new());
        let throttled = ThrottledMessenger::new(fake.clone(), ThrottleConfig::default());
        let msg = fake.send_html(ChatId(5), "card").await.unwrap();
        let kb =
            InlineKeyboard::one_per_row(vec![InlineButton::callback("Block", "user_toggle_5")]);

        throttled.edit_keyboard(msg, "card v2", kb.clone()).await.unwrap();

        assert_eq!(fake.edited(), vec!["card v2".to_string()]);
        assert_eq!(fake.edited_keyboards(), vec![kb]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_chat_limiters_are_pruned() {
        let throttled = ThrottledMessenger::new(
            Arc::new(FakeMessenger::new()),
            ThrottleConfig {
                global_min_interval: Duration::ZERO,
                per_chat_min_interval: Duration::from_millis(100),
            },
        );
        for chat in 0..PRUNE_THRESHOLD as i64 {
            throttled.reserve_chat(chat).await;
        }
        assert_eq!(throttled.per_chat.lock().await.len(), PRUNE_THRESHOLD);

        // A busy chat keeps its slot; the idle ones go.
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(throttled.reserve_chat(7).await, Duration::ZERO);
        assert_eq!(throttled.reserve_chat(-1).await, Duration::ZERO);
        assert_eq!(throttled.per_chat.lock().await.len(), 2);
        assert_eq!(throttled.reserve_chat(7).await, Duration::from_millis(100));
    }
}
