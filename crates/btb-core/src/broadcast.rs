//! Orchestration around the dispatcher: validate, persist, resolve, deliver,
//! record. Shared by the admin front-end and the scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    campaign::{Campaign, CampaignContent, CampaignPayload, DeliveryOutcome},
    dispatch::{Dispatcher, NoProgress, ProgressSink},
    domain::{CampaignId, TemplateId, UserId},
    errors::Error,
    segment::{self, Segment},
    store::Store,
    Result,
};

/// Minimum length of a template name, in characters.
pub const MIN_TEMPLATE_NAME_LEN: usize = 3;

/// What happened to a submitted campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    Delivered {
        campaign_id: CampaignId,
        outcome: DeliveryOutcome,
    },
    Scheduled {
        campaign_id: CampaignId,
        at: DateTime<Utc>,
    },
}

/// Result of one due campaign processed by [`BroadcastService::run_due`].
#[derive(Debug)]
pub struct DueRun {
    pub campaign: Campaign,
    pub result: Result<DeliveryOutcome>,
}

pub struct BroadcastService {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
}

impl BroadcastService {
    pub fn new(store: Arc<Store>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.dispatcher.is_configured()
    }

    fn preflight(&self, content: &CampaignContent) -> Result<()> {
        if !self.dispatcher.is_configured() {
            return Err(Error::TransportNotConfigured);
        }
        content.validate()
    }

    /// Route a finished compose payload: immediate or scheduled.
    pub async fn submit(
        &self,
        operator: UserId,
        payload: &CampaignPayload,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Submitted> {
        match payload.scheduled_at {
            Some(at) => {
                let campaign_id = self.schedule(operator, &payload.content, payload.segment, at)?;
                Ok(Submitted::Scheduled { campaign_id, at })
            }
            None => {
                let (campaign_id, outcome) = self
                    .send_now(operator, &payload.content, payload.segment, progress, cancel)
                    .await?;
                Ok(Submitted::Delivered {
                    campaign_id,
                    outcome,
                })
            }
        }
    }

    /// Create an immediate campaign and deliver it to `segment` as it is now.
    pub async fn send_now(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(CampaignId, DeliveryOutcome)> {
        self.preflight(content)?;
        let now = Utc::now();
        let id = self.store.create_immediate_at(operator, content, segment, now)?;
        tracing::info!(
            campaign = id.0,
            operator = operator.0,
            %segment,
            "immediate campaign created"
        );

        let recipients = segment::resolve_at(&self.store, segment, now)?;
        let outcome = self
            .dispatcher
            .dispatch(content, &recipients, progress, cancel)
            .await?;
        self.finish(id, outcome)?;
        Ok((id, outcome))
    }

    /// Persist a campaign for later delivery by the scheduler.
    pub fn schedule(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        at: DateTime<Utc>,
    ) -> Result<CampaignId> {
        self.schedule_at(operator, content, segment, at, Utc::now())
    }

    pub fn schedule_at(
        &self,
        operator: UserId,
        content: &CampaignContent,
        segment: Segment,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CampaignId> {
        self.preflight(content)?;
        if at <= now {
            return Err(Error::InvalidInput(
                "the scheduled time must be in the future".to_string(),
            ));
        }
        let id = self
            .store
            .create_scheduled_at(operator, content, segment, at, now)?;
        tracing::info!(campaign = id.0, operator = operator.0, %segment, %at, "campaign scheduled");
        Ok(id)
    }

    /// Deliver one persisted campaign, resolving its segment at `now`.
    pub async fn deliver_campaign(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        if !campaign.pending {
            return Err(Error::InvalidInput(format!(
                "campaign {} was already delivered",
                campaign.id
            )));
        }
        let recipients = segment::resolve_label_at(&self.store, &campaign.segment, now)?;
        let outcome = self
            .dispatcher
            .dispatch(&campaign.content, &recipients, progress, cancel)
            .await?;
        self.finish(campaign.id, outcome)?;
        Ok(outcome)
    }

    /// Deliver every campaign due at `now`, one after another.
    ///
    /// Failures stay per campaign: a failed campaign remains pending and is
    /// retried on a later call. Stops early once `cancel` fires.
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DueRun>> {
        let due = self.store.list_due(now)?;
        let mut runs = Vec::with_capacity(due.len());
        for campaign in due {
            if cancel.is_cancelled() {
                break;
            }
            tracing::info!(
                campaign = campaign.id.0,
                segment = %campaign.segment,
                "delivering scheduled campaign"
            );
            let result = self
                .deliver_campaign(&campaign, now, &NoProgress, cancel)
                .await;
            if let Err(e) = &result {
                tracing::error!(campaign = campaign.id.0, "scheduled campaign failed: {e}");
            }
            runs.push(DueRun { campaign, result });
        }
        Ok(runs)
    }

    fn finish(&self, id: CampaignId, outcome: DeliveryOutcome) -> Result<()> {
        let persisted = self
            .store
            .record_outcome(id, outcome)
            .and_then(|_| self.store.mark_delivered(id));
        match persisted {
            Ok(_) => {
                tracing::info!(
                    campaign = id.0,
                    sent = outcome.sent,
                    failed = outcome.failed,
                    "campaign delivered"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(campaign = id.0, "delivery outcome not persisted: {e}");
                Err(Error::OutcomeNotPersisted {
                    campaign_id: id,
                    sent: outcome.sent,
                    failed: outcome.failed,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Content of one of `owner`'s templates, ready to send.
    pub fn instantiate_template(&self, id: TemplateId, owner: UserId) -> Result<CampaignContent> {
        match self.store.get_template(id)? {
            Some(t) if t.operator_id == owner => Ok(t.to_content()),
            _ => Err(Error::NotFound(format!("template {id}"))),
        }
    }

    /// Save the content of `campaign_id` (which must belong to `owner`) as a template.
    pub fn save_template_from(
        &self,
        owner: UserId,
        campaign_id: CampaignId,
        name: &str,
    ) -> Result<TemplateId> {
        let name = validate_template_name(name)?;
        let campaign = self
            .store
            .get_campaign(campaign_id)?
            .filter(|c| c.operator_id == owner)
            .ok_or_else(|| Error::NotFound(format!("campaign {campaign_id}")))?;
        let id = self.store.save_template(owner, name, &campaign.content)?;
        tracing::info!(template = id.0, owner = owner.0, "template saved");
        Ok(id)
    }
}

pub fn validate_template_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.chars().count() < MIN_TEMPLATE_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "template name must be at least {MIN_TEMPLATE_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::{
        dispatch::{DispatchConfig, Progress},
        messaging::{fake::FakeMessenger, types::LinkButton},
        store::{recipients::Profile, test_support::drop_campaigns},
    };

    /// Deletes the campaign rows once the last recipient is processed.
    struct DropCampaignsAtEnd(Arc<Store>);

    #[async_trait]
    impl ProgressSink for DropCampaignsAtEnd {
        async fn report(&self, p: Progress) -> Result<()> {
            if p.processed == p.total {
                drop_campaigns(&self.0);
            }
            Ok(())
        }
    }

    fn service(fake: Option<Arc<FakeMessenger>>) -> (BroadcastService, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = fake.map(|f| f as Arc<dyn crate::messaging::port::MessagingPort>);
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            DispatchConfig {
                send_delay: std::time::Duration::ZERO,
                progress_every: 5,
            },
        ));
        (BroadcastService::new(store.clone(), dispatcher), store)
    }

    #[tokio::test]
    async fn new_segment_delivery_is_recorded() {
        let fake = Arc::new(FakeMessenger::new());
        let (svc, store) = service(Some(fake.clone()));
        let p = Profile::default();
        let now = Utc::now();
        store.upsert_at(UserId(1), &p, None, now - Duration::days(1)).unwrap();
        store.upsert_at(UserId(2), &p, None, now - Duration::days(2)).unwrap();
        store.upsert_at(UserId(3), &p, None, now - Duration::days(60)).unwrap();

        let (id, outcome) = svc
            .send_now(
                UserId(100),
                &CampaignContent::text("hi"),
                Segment::New,
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome { sent: 2, failed: 0 });
        assert_eq!(fake.sent_to(), vec![1, 2]);
        let c = store.get_campaign(id).unwrap().unwrap();
        assert!(!c.pending);
        assert_eq!((c.sent_count, c.failed_count), (2, 0));
    }

    #[tokio::test]
    async fn blocked_recipient_counts_as_failed() {
        let fake = Arc::new(FakeMessenger::new().fail_for(2));
        let (svc, store) = service(Some(fake));
        let now = Utc::now();
        for id in [1, 2] {
            store
                .upsert_at(UserId(id), &Profile::default(), None, now - Duration::days(1))
                .unwrap();
        }

        let (id, outcome) = svc
            .send_now(
                UserId(100),
                &CampaignContent::text("hi"),
                Segment::New,
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome { sent: 1, failed: 1 });
        let c = store.get_campaign(id).unwrap().unwrap();
        assert_eq!((c.sent_count, c.failed_count), (1, 1));
    }

    #[tokio::test]
    async fn lost_outcome_is_reported_as_not_persisted() {
        let fake = Arc::new(FakeMessenger::new());
        let (svc, store) = service(Some(fake.clone()));
        for id in [1, 2] {
            store.upsert(UserId(id), &Profile::default(), None).unwrap();
        }

        let err = svc
            .send_now(
                UserId(100),
                &CampaignContent::text("hi"),
                Segment::All,
                &DropCampaignsAtEnd(store.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::OutcomeNotPersisted { sent, failed, .. } => assert_eq!((sent, failed), (2, 0)),
            other => panic!("expected OutcomeNotPersisted, got {other:?}"),
        }
        assert_eq!(fake.sent_to(), vec![1, 2]);
    }

    #[tokio::test]
    async fn rejections_persist_nothing() {
        let (svc, store) = service(None);
        let err = svc
            .send_now(
                UserId(1),
                &CampaignContent::text("hi"),
                Segment::All,
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let (svc, _) = service(Some(Arc::new(FakeMessenger::new())));
        let err = svc
            .schedule(
                UserId(1),
                &CampaignContent::default(),
                Segment::All,
                Utc::now() + Duration::hours(1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.list_recent(10, true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduling_requires_a_future_time() {
        let (svc, store) = service(Some(Arc::new(FakeMessenger::new())));
        let now = Utc::now();
        let content = CampaignContent::text("later");
        assert!(svc
            .schedule_at(UserId(1), &content, Segment::All, now, now)
            .is_err());

        let id = svc
            .schedule_at(UserId(1), &content, Segment::All, now + Duration::minutes(5), now)
            .unwrap();
        assert_eq!(store.list_upcoming(now).unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn run_due_resolves_segment_at_delivery_time() {
        let fake = Arc::new(FakeMessenger::new());
        let (svc, store) = service(Some(fake.clone()));
        let t0 = Utc::now();
        let due_at = t0 + Duration::hours(1);
        let id = svc
            .schedule_at(UserId(9), &CampaignContent::text("x"), Segment::All, due_at, t0)
            .unwrap();

        // Registered after scheduling, before delivery.
        store
            .upsert_at(UserId(5), &Profile::default(), None, t0 + Duration::minutes(30))
            .unwrap();

        let runs = svc.run_due(due_at, &CancellationToken::new()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].campaign.id, id);
        assert_eq!(
            runs[0].result.as_ref().unwrap(),
            &DeliveryOutcome { sent: 1, failed: 0 }
        );
        assert_eq!(fake.sent_to(), vec![5]);
        assert!(svc.run_due(due_at, &CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn templates_instantiate_for_their_owner_only() {
        let fake = Arc::new(FakeMessenger::new());
        let (svc, store) = service(Some(fake));
        let content = CampaignContent {
            text: "Body".to_string(),
            image_ref: Some("img".to_string()),
            buttons: vec![LinkButton {
                text: "Go".to_string(),
                url: "https://example.com".to_string(),
            }],
        };
        let (campaign_id, _) = svc
            .send_now(UserId(1), &content, Segment::All, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        assert!(svc.save_template_from(UserId(1), campaign_id, "ab").is_err());
        assert!(matches!(
            svc.save_template_from(UserId(2), campaign_id, "Promo"),
            Err(Error::NotFound(_))
        ));

        let tid = svc.save_template_from(UserId(1), campaign_id, "  Promo ").unwrap();
        assert_eq!(store.get_template(tid).unwrap().unwrap().name, "Promo");
        assert_eq!(svc.instantiate_template(tid, UserId(1)).unwrap(), content);
        assert!(matches!(
            svc.instantiate_template(tid, UserId(2)),
            Err(Error::NotFound(_))
        ));
    }
}
