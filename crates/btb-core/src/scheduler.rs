//! Background loop that delivers scheduled campaigns once they are due.
//!
//! - Polls the store every `poll_interval`; the first poll runs right away.
//! - Each due campaign is delivered through [`BroadcastService`].
//! - A failed campaign stays pending and is retried on the next poll
//!   (at-least-once; a crash between delivery and the final write repeats it).
//! - The owner is notified through the admin messenger, best effort.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::{BroadcastService, DueRun},
    domain::ChatId,
    formatting::{escape_html, outcome_html, truncate_text},
    messaging::port::MessagingPort,
    Result,
};

#[derive(Clone)]
pub struct BroadcastScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    service: Arc<BroadcastService>,
    notifier: Option<Arc<dyn MessagingPort>>,
    poll_interval: Duration,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    worker: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl BroadcastScheduler {
    pub fn new(
        service: Arc<BroadcastService>,
        notifier: Option<Arc<dyn MessagingPort>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                service,
                notifier,
                poll_interval,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Spawn the polling loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.worker.is_some() {
            return false;
        }

        let tok = CancellationToken::new();
        st.cancel = Some(tok.clone());
        let scheduler = self.clone();
        let period = self.inner.poll_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = scheduler.tick(Utc::now(), &tok).await {
                      tracing::error!("scheduler poll failed: {e}");
                    }
                  }
                }
            }
            tracing::info!("scheduler stopped");
        });

        st.worker = Some(handle);
        tracing::info!(interval_secs = period.as_secs_f64(), "scheduler started");
        true
    }

    /// Cancel the loop and wait for it to exit. A dispatch in flight is
    /// cancelled; its campaign stays pending.
    pub async fn stop(&self) {
        let (tok, handle) = {
            let mut st = self.inner.state.lock().await;
            (st.cancel.take(), st.worker.take())
        };
        if let Some(tok) = tok {
            tok.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("scheduler task ended abnormally: {e}");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.worker.is_some()
    }

    /// One poll: deliver what is due at `now` and notify owners.
    /// Returns how many campaigns were attempted.
    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<usize> {
        let runs = self.inner.service.run_due(now, cancel).await?;
        for run in &runs {
            self.notify(run).await;
        }
        Ok(runs.len())
    }

    async fn notify(&self, run: &DueRun) {
        let Some(messenger) = &self.inner.notifier else {
            return;
        };
        let Ok(outcome) = &run.result else {
            return;
        };
        let preview = escape_html(&truncate_text(run.campaign.content.text.trim(), 100));
        let html = format!(
            "⏰ <b>Scheduled broadcast {} delivered</b>\n🎯 Segment: {}\n\n{}\n\n{preview}",
            run.campaign.id,
            run.campaign.segment().title(),
            outcome_html(*outcome)
        );
        let owner = ChatId::from(run.campaign.operator_id);
        if let Err(e) = messenger.send_html(owner, &html).await {
            tracing::warn!(campaign = run.campaign.id.0, "owner notification failed: {e}");
        }
    }
}
