use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TrunklineResult<T> = Result<T, TrunklineError>;

#[derive(Error, Debug)]
pub enum TrunklineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Campaign error: {0}")]
    Campaign(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Classified send-failure kind, persisted on the message row. These are
/// the only failure categories the API surface ever reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    /// Renderer rejected the command; nothing was sent.
    InvalidCommand,
    /// Upstream or limiter throttled the send; retried transparently.
    RateLimited,
    /// 5xx / timeout / connection failure; retried up to the attempt cap.
    TransientUpstream,
    /// Non-retryable upstream rejection (4xx other than 429).
    PermanentUpstream,
    /// 401/403 from upstream; the access token needs operator attention.
    AuthExpired,
    /// The owning campaign was cancelled before the send.
    Cancelled,
}

/// The error recorded in `Message::last_error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub code: Option<i64>,
    pub detail: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, code: Option<i64>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(SendErrorKind::Cancelled, None, "campaign cancelled")
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?} ({}): {}", self.kind, code, self.detail),
            None => write!(f, "{:?}: {}", self.kind, self.detail),
        }
    }
}
