use crate::domain::CampaignId;

/// Core error type for the broadcast bot.
///
/// Adapter crates map their specific errors into this type so the bot core can
/// tell operator-facing failures (bad input, missing config) apart from
/// infrastructure failures (store, transport).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no user bot transport is configured for outbound sends")]
    TransportNotConfigured,

    #[error("dispatch cancelled after {processed}/{total} recipients")]
    Cancelled { processed: usize, total: usize },

    #[error(
        "campaign {campaign_id} delivered (sent {sent}, failed {failed}) but the outcome was not persisted: {reason}"
    )]
    OutcomeNotPersisted {
        campaign_id: CampaignId,
        sent: u64,
        failed: u64,
        reason: String,
    },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Errors raised by pre-flight validation; nothing was sent.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::NotFound(_) | Error::TransportNotConfigured
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
