//! Per-operator conversation state for multi-step admin flows.
//!
//! Each operator has at most one [`ComposeState`]. Incoming input is fed to
//! [`transition`], which returns the next state (or `None` when the flow is
//! over) and a [`Step`] telling the front-end what to show or do next.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    broadcast::validate_template_name,
    campaign::{parse_buttons, parse_schedule_time, CampaignContent, CampaignPayload},
    domain::{CampaignId, UserId},
    errors::Error,
    segment::Segment,
};

const SKIP_WORDS: [&str; 7] = [
    "нет",
    "no",
    "n",
    "пропустить",
    "skip",
    "продолжить",
    "без кнопок",
];
const ADD_BUTTON_WORDS: [&str; 6] = [
    "да",
    "yes",
    "y",
    "кнопки",
    "buttons",
    "добавить кнопки",
];
const CONFIRM_WORDS: [&str; 5] = ["да", "yes", "y", "ок", "ok"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeMode {
    Immediate,
    Scheduled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComposeState {
    AwaitingContent {
        mode: ComposeMode,
    },
    AwaitingSegment {
        mode: ComposeMode,
        draft: CampaignContent,
    },
    AwaitingButtons {
        mode: ComposeMode,
        draft: CampaignContent,
        segment: Segment,
    },
    AwaitingSchedule {
        draft: CampaignContent,
        segment: Segment,
    },
    AwaitingConfirmation {
        draft: CampaignContent,
        segment: Segment,
        scheduled_at: Option<DateTime<Utc>>,
    },
    AwaitingTemplateName {
        campaign_id: CampaignId,
    },
    AwaitingUserSearch,
}

/// Operator input relevant to a compose flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComposeInput {
    /// A chat message: HTML text (or caption) and/or a photo reference.
    Message {
        html: String,
        image_ref: Option<String>,
    },
    /// A segment picked from the inline keyboard.
    SegmentChosen(Segment),
}

impl ComposeInput {
    pub fn text(html: impl Into<String>) -> Self {
        ComposeInput::Message {
            html: html.into(),
            image_ref: None,
        }
    }
}

/// What the front-end should do after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// No flow is active for this operator.
    Idle,
    AskSegment {
        mode: ComposeMode,
    },
    AskButtons {
        draft: CampaignContent,
        segment: Segment,
    },
    ButtonHelp,
    ButtonsNotRecognized,
    AskScheduleTime,
    Preview(CampaignPayload),
    /// Confirmed: hand the payload to the broadcast service.
    Submit(CampaignPayload),
    Cancelled,
    SaveTemplate {
        campaign_id: CampaignId,
        name: String,
    },
    SearchUsers(String),
    /// Input rejected; the state is unchanged.
    Rejected(String),
}

/// Reply classification for the buttons question.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ButtonsReply {
    Skip,
    WantButtons,
    ButtonList,
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

fn classify_buttons_reply(text: &str) -> ButtonsReply {
    let t = normalize(text);
    if SKIP_WORDS.contains(&t.as_str()) {
        ButtonsReply::Skip
    } else if ADD_BUTTON_WORDS.contains(&t.as_str()) {
        ButtonsReply::WantButtons
    } else {
        ButtonsReply::ButtonList
    }
}

pub fn is_confirmation(text: &str) -> bool {
    CONFIRM_WORDS.contains(&normalize(text).as_str())
}

fn reason(e: Error) -> String {
    match e {
        Error::InvalidInput(m) => m,
        other => other.to_string(),
    }
}

fn after_buttons(
    mode: ComposeMode,
    draft: CampaignContent,
    segment: Segment,
) -> (Option<ComposeState>, Step) {
    match mode {
        ComposeMode::Immediate => {
            let payload = CampaignPayload {
                content: draft.clone(),
                segment,
                scheduled_at: None,
            };
            (
                Some(ComposeState::AwaitingConfirmation {
                    draft,
                    segment,
                    scheduled_at: None,
                }),
                Step::Preview(payload),
            )
        }
        ComposeMode::Scheduled => (
            Some(ComposeState::AwaitingSchedule { draft, segment }),
            Step::AskScheduleTime,
        ),
    }
}

/// Advance one state by one input.
pub fn transition(
    state: ComposeState,
    input: ComposeInput,
    now: DateTime<Utc>,
) -> (Option<ComposeState>, Step) {
    use ComposeInput::{Message, SegmentChosen};
    use ComposeState::*;

    match (state, input) {
        (AwaitingContent { mode }, Message { html, image_ref }) => {
            let draft = CampaignContent {
                text: html,
                image_ref,
                buttons: Vec::new(),
            };
            match draft.validate() {
                Ok(()) => (
                    Some(AwaitingSegment { mode, draft }),
                    Step::AskSegment { mode },
                ),
                Err(e) => (Some(AwaitingContent { mode }), Step::Rejected(reason(e))),
            }
        }

        (AwaitingSegment { mode, draft }, SegmentChosen(segment)) => (
            Some(AwaitingButtons {
                mode,
                draft: draft.clone(),
                segment,
            }),
            Step::AskButtons { draft, segment },
        ),

        (AwaitingButtons { mode, draft, segment }, Message { html, image_ref }) => {
            if image_ref.is_some() && html.trim().is_empty() {
                return (
                    Some(AwaitingButtons { mode, draft, segment }),
                    Step::Rejected(
                        "the photo is already attached; answer the buttons question".to_string(),
                    ),
                );
            }
            match classify_buttons_reply(&html) {
                ButtonsReply::Skip => after_buttons(mode, draft, segment),
                ButtonsReply::WantButtons => {
                    (Some(AwaitingButtons { mode, draft, segment }), Step::ButtonHelp)
                }
                ButtonsReply::ButtonList => {
                    let buttons = parse_buttons(&html);
                    if buttons.is_empty() {
                        return (
                            Some(AwaitingButtons { mode, draft, segment }),
                            Step::ButtonsNotRecognized,
                        );
                    }
                    let draft = CampaignContent { buttons, ..draft };
                    after_buttons(mode, draft, segment)
                }
            }
        }

        (AwaitingSchedule { draft, segment }, Message { html, .. }) => {
            match parse_schedule_time(&html, now) {
                Ok(at) => {
                    let payload = CampaignPayload {
                        content: draft.clone(),
                        segment,
                        scheduled_at: Some(at),
                    };
                    (
                        Some(AwaitingConfirmation {
                            draft,
                            segment,
                            scheduled_at: Some(at),
                        }),
                        Step::Preview(payload),
                    )
                }
                Err(e) => (Some(AwaitingSchedule { draft, segment }), Step::Rejected(reason(e))),
            }
        }

        (
            AwaitingConfirmation {
                draft,
                segment,
                scheduled_at,
            },
            Message { html, .. },
        ) => {
            if is_confirmation(&html) {
                (
                    None,
                    Step::Submit(CampaignPayload {
                        content: draft,
                        segment,
                        scheduled_at,
                    }),
                )
            } else {
                (None, Step::Cancelled)
            }
        }

        (AwaitingTemplateName { campaign_id }, Message { html, .. }) => {
            match validate_template_name(&html) {
                Ok(name) => (
                    None,
                    Step::SaveTemplate {
                        campaign_id,
                        name: name.to_string(),
                    },
                ),
                Err(e) => (Some(AwaitingTemplateName { campaign_id }), Step::Rejected(reason(e))),
            }
        }

        (AwaitingUserSearch, Message { html, .. }) => {
            let query = html.trim();
            if query.is_empty() {
                (
                    Some(AwaitingUserSearch),
                    Step::Rejected("send a name, @username or id".to_string()),
                )
            } else {
                (None, Step::SearchUsers(query.to_string()))
            }
        }

        (AwaitingSegment { mode, draft }, Message { .. }) => (
            Some(AwaitingSegment { mode, draft }),
            Step::Rejected("pick a segment with the buttons above".to_string()),
        ),

        (state, SegmentChosen(_)) => (
            Some(state),
            Step::Rejected("no segment choice is expected right now".to_string()),
        ),
    }
}

/// Compose states of every operator, keyed by operator id.
#[derive(Default)]
pub struct ComposeSessions {
    inner: tokio::sync::Mutex<HashMap<UserId, ComposeState>>,
}

impl ComposeSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a flow, replacing whatever was in progress.
    pub async fn begin(&self, operator: UserId, state: ComposeState) {
        self.inner.lock().await.insert(operator, state);
    }

    /// Drop the operator's flow. Returns whether one was active.
    pub async fn cancel(&self, operator: UserId) -> bool {
        self.inner.lock().await.remove(&operator).is_some()
    }

    pub async fn get(&self, operator: UserId) -> Option<ComposeState> {
        self.inner.lock().await.get(&operator).cloned()
    }

    pub async fn handle(&self, operator: UserId, input: ComposeInput) -> Step {
        self.handle_at(operator, input, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        operator: UserId,
        input: ComposeInput,
        now: DateTime<Utc>,
    ) -> Step {
        let mut map = self.inner.lock().await;
        let Some(state) = map.remove(&operator) else {
            return Step::Idle;
        };
        let (next, step) = transition(state, input, now);
        if let Some(next) = next {
            map.insert(operator, next);
        }
        tracing::debug!(operator = operator.0, ?step, "compose step");
        step
    }
}
