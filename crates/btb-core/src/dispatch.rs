//! The broadcast engine: one delivery attempt per recipient, paced, with
//! progress reporting and cooperative cancellation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    campaign::{CampaignContent, DeliveryOutcome},
    config::Config,
    domain::{ChatId, MessageRef, UserId},
    errors::Error,
    formatting::progress_html,
    messaging::{port::MessagingPort, types::InlineKeyboard},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Pause between two consecutive sends.
    pub send_delay: Duration,
    /// Report progress after every N-th recipient (and always after the last).
    pub progress_every: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_delay: Duration::from_millis(50),
            progress_every: 5,
        }
    }
}

impl From<&Config> for DispatchConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            send_delay: cfg.send_delay,
            progress_every: cfg.progress_every,
        }
    }
}

/// Snapshot handed to a [`ProgressSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub sent: u64,
    pub failed: u64,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: Progress) -> Result<()>;
}

/// Discards progress (scheduled campaigns have nobody watching).
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: Progress) -> Result<()> {
        Ok(())
    }
}

/// Edits one operator-facing message with a progress bar.
///
/// Edits run on their own task and only the newest snapshot is rendered, so a
/// rate-limited edit never holds up delivery. Call [`MessageProgress::finish`]
/// before replacing the message, otherwise a late edit may overwrite it.
pub struct MessageProgress {
    tx: watch::Sender<Option<Progress>>,
    renderer: JoinHandle<()>,
}

impl MessageProgress {
    pub fn new(messenger: Arc<dyn MessagingPort>, msg: MessageRef) -> Self {
        let (tx, mut rx) = watch::channel(None::<Progress>);
        let renderer = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(p) = *rx.borrow_and_update() else {
                    continue;
                };
                let html = progress_html(p.processed, p.total, p.sent, p.failed);
                if let Err(e) = messenger.edit_html(msg, &html).await {
                    tracing::debug!("progress update failed: {e}");
                }
            }
        });
        Self { tx, renderer }
    }

    /// Render the last pending snapshot and stop editing.
    pub async fn finish(self) {
        let Self { tx, renderer } = self;
        drop(tx);
        if let Err(e) = renderer.await {
            tracing::warn!("progress renderer failed: {e}");
        }
    }
}

#[async_trait]
impl ProgressSink for MessageProgress {
    async fn report(&self, p: Progress) -> Result<()> {
        self.tx.send_replace(Some(p));
        Ok(())
    }
}

pub struct Dispatcher {
    transport: Option<Arc<dyn MessagingPort>>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    /// `transport` is the user-facing bot; `None` disables outbound sends.
    pub fn new(transport: Option<Arc<dyn MessagingPort>>, cfg: DispatchConfig) -> Self {
        Self { transport, cfg }
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    pub fn config(&self) -> DispatchConfig {
        self.cfg
    }

    /// Deliver `content` to every recipient in order.
    ///
    /// Per-recipient transport failures are counted, never propagated; the
    /// returned outcome always satisfies `sent + failed == recipients.len()`.
    /// A cancelled pass yields [`Error::Cancelled`] and no outcome.
    pub async fn dispatch(
        &self,
        content: &CampaignContent,
        recipients: &[UserId],
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(Error::TransportNotConfigured)?;
        content.validate()?;

        let total = recipients.len();
        let every = self.cfg.progress_every.max(1);
        let keyboard = InlineKeyboard::from_links(&content.buttons);
        let mut outcome = DeliveryOutcome::default();

        tracing::info!(total, "dispatch started");

        for (idx, &user) in recipients.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(cancelled(idx, total, outcome));
            }

            match send_one(transport.as_ref(), content, keyboard.clone(), user).await {
                Ok(_) => outcome.sent += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(user = user.0, "delivery failed: {e}");
                }
            }

            let processed = idx + 1;
            if processed % every == 0 || processed == total {
                let snapshot = Progress {
                    processed,
                    total,
                    sent: outcome.sent,
                    failed: outcome.failed,
                };
                if let Err(e) = progress.report(snapshot).await {
                    tracing::debug!("progress update failed: {e}");
                }
            }

            if processed < total {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled(processed, total, outcome)),
                    _ = tokio::time::sleep(self.cfg.send_delay) => {}
                }
            }
        }

        tracing::info!(sent = outcome.sent, failed = outcome.failed, "dispatch finished");
        Ok(outcome)
    }
}

fn cancelled(processed: usize, total: usize, partial: DeliveryOutcome) -> Error {
    tracing::warn!(
        processed,
        total,
        sent = partial.sent,
        failed = partial.failed,
        "dispatch cancelled"
    );
    Error::Cancelled { processed, total }
}

async fn send_one(
    transport: &dyn MessagingPort,
    content: &CampaignContent,
    keyboard: Option<InlineKeyboard>,
    user: UserId,
) -> Result<MessageRef> {
    let chat_id = ChatId::from(user);
    if let Some(photo) = content.image_ref.as_deref().filter(|_| content.has_image()) {
        let caption = content.has_text().then_some(content.text.as_str());
        return transport.send_photo(chat_id, photo, caption, keyboard).await;
    }
    match keyboard {
        Some(kb) => transport.send_keyboard(chat_id, &content.text, kb).await,
        None => transport.send_html(chat_id, &content.text).await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::messaging::{
        fake::{FakeMessenger, Sent},
        throttled::{ThrottleConfig, ThrottledMessenger},
        types::LinkButton,
    };

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Progress>>,
        cancel_at: Option<(usize, CancellationToken)>,
        fail: bool,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, p: Progress) -> Result<()> {
            self.seen.lock().unwrap().push(p);
            if let Some((at, tok)) = &self.cancel_at {
                if p.processed >= *at {
                    tok.cancel();
                }
            }
            if self.fail {
                return Err(Error::External("edit failed".to_string()));
            }
            Ok(())
        }
    }

    fn ids(range: std::ops::RangeInclusive<i64>) -> Vec<UserId> {
        range.map(UserId).collect()
    }

    fn dispatcher(fake: Arc<FakeMessenger>) -> Dispatcher {
        Dispatcher::new(Some(fake), DispatchConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn every_recipient_is_counted_exactly_once() {
        let fake = Arc::new(FakeMessenger::new().fail_for(3).fail_for(9));
        let d = dispatcher(fake.clone());
        let recorder = Recorder::default();

        let outcome = d
            .dispatch(
                &CampaignContent::text("hi"),
                &ids(1..=12),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome { sent: 10, failed: 2 });
        assert_eq!(outcome.total(), 12);
        assert_eq!(fake.sent_to(), vec![1, 2, 4, 5, 6, 7, 8, 10, 11, 12]);

        let processed: Vec<_> = recorder.seen.lock().unwrap().iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![5, 10, 12]);
        let last = *recorder.seen.lock().unwrap().last().unwrap();
        assert_eq!((last.sent, last.failed, last.total), (10, 2, 12));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_paced_by_the_configured_delay() {
        let fake = Arc::new(FakeMessenger::new());
        let d = Dispatcher::new(
            Some(fake),
            DispatchConfig {
                send_delay: Duration::from_millis(200),
                progress_every: 5,
            },
        );
        let started = tokio::time::Instant::now();
        d.dispatch(
            &CampaignContent::text("hi"),
            &ids(1..=4),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        // Three gaps between four sends.
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn photo_content_goes_out_as_captioned_photo_with_buttons() {
        let fake = Arc::new(FakeMessenger::new());
        let d = dispatcher(fake.clone());
        let content = CampaignContent {
            text: "<b>Sale</b>".to_string(),
            image_ref: Some("photo-file-id".to_string()),
            buttons: vec![LinkButton {
                text: "Shop".to_string(),
                url: "https://example.com".to_string(),
            }],
        };

        d.dispatch(&content, &ids(1..=1), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        match &fake.sent()[0] {
            Sent::Photo {
                photo,
                caption,
                keyboard,
                ..
            } => {
                assert_eq!(photo, "photo-file-id");
                assert_eq!(caption.as_deref(), Some("<b>Sale</b>"));
                assert_eq!(keyboard.as_ref().map(|k| k.rows.len()), Some(1));
            }
            other => panic!("expected a photo, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_with_buttons_uses_a_keyboard_message() {
        let fake = Arc::new(FakeMessenger::new());
        let d = dispatcher(fake.clone());
        let content = CampaignContent {
            text: "hello".to_string(),
            image_ref: None,
            buttons: vec![LinkButton {
                text: "Open".to_string(),
                url: "t.me/example".to_string(),
            }],
        };
        d.dispatch(&content, &ids(1..=1), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(fake.sent()[0], Sent::Keyboard { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_run_reports_no_outcome() {
        let fake = Arc::new(FakeMessenger::new());
        let d = dispatcher(fake.clone());
        let tok = CancellationToken::new();
        let recorder = Recorder {
            cancel_at: Some((5, tok.clone())),
            ..Default::default()
        };

        let err = d
            .dispatch(&CampaignContent::text("hi"), &ids(1..=20), &recorder, &tok)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Cancelled {
                processed: 5,
                total: 20
            }
        ));
        assert_eq!(fake.sent().len(), 5);
    }

    #[tokio::test]
    async fn already_cancelled_sends_nothing() {
        let fake = Arc::new(FakeMessenger::new());
        let d = dispatcher(fake.clone());
        let tok = CancellationToken::new();
        tok.cancel();
        let err = d
            .dispatch(&CampaignContent::text("hi"), &ids(1..=3), &NoProgress, &tok)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { processed: 0, total: 3 }));
        assert!(fake.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_errors_do_not_abort_delivery() {
        let fake = Arc::new(FakeMessenger::new());
        let d = dispatcher(fake.clone());
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let outcome = d
            .dispatch(
                &CampaignContent::text("hi"),
                &ids(1..=7),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.sent, 7);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refuses_without_transport_or_content() {
        let none = Dispatcher::new(None, DispatchConfig::default());
        let err = none
            .dispatch(
                &CampaignContent::text("hi"),
                &ids(1..=1),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportNotConfigured));

        let d = dispatcher(Arc::new(FakeMessenger::new()));
        let err = d
            .dispatch(
                &CampaignContent::default(),
                &ids(1..=1),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_recipient_list_is_a_zero_outcome() {
        let d = dispatcher(Arc::new(FakeMessenger::new()));
        let outcome = d
            .dispatch(
                &CampaignContent::text("hi"),
                &[],
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn message_progress_edits_the_operator_message() {
        let admin = Arc::new(FakeMessenger::new());
        let msg = admin.send_html(ChatId(1), "starting").await.unwrap();
        let sink = MessageProgress::new(admin.clone(), msg);
        let d = dispatcher(Arc::new(FakeMessenger::new()));

        d.dispatch(
            &CampaignContent::text("hi"),
            &ids(1..=5),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        sink.finish().await;

        let edits = admin.edited();
        assert_eq!(edits.len(), 1);
        assert!(edits[0].contains("5/5"));
        assert!(edits[0].contains("100%"));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_progress_edits_do_not_slow_delivery() {
        let fake_admin = Arc::new(FakeMessenger::new());
        let msg = fake_admin.send_html(ChatId(1), "starting").await.unwrap();
        let admin: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
            fake_admin.clone(),
            ThrottleConfig::default(),
        ));
        let sink = MessageProgress::new(admin, msg);
        let d = dispatcher(Arc::new(FakeMessenger::new()));

        let started = tokio::time::Instant::now();
        let outcome = d
            .dispatch(
                &CampaignContent::text("hi"),
                &ids(1..=100),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();
        sink.finish().await;

        assert_eq!(outcome.sent, 100);
        // 99 gaps of 50ms; edits are limited to ~1/s in that chat.
        assert!(elapsed >= Duration::from_millis(4950), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(5100), "{elapsed:?}");

        let edits = fake_admin.edited();
        assert!(edits.len() < 20, "{} edits", edits.len());
        assert!(edits.last().unwrap().contains("100/100"));
    }
}
