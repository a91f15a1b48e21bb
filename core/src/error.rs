use thiserror::Error;

/// Failures reported by the external credential provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no active session")]
    NoSession,
    #[error("credential provider unavailable: {0}")]
    Unavailable(String),
    #[error("refresh rejected: {0}")]
    RefreshRejected(String),
    #[error("auth change subscription failed: {0}")]
    Subscription(String),
}

/// Failures surfaced to the caller of a streaming query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Missing, expired or unrefreshable credentials. No request was sent.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The request could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),
    /// The endpoint answered with a non-success status.
    #[error("query rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    /// The body failed after the stream had opened.
    #[error("stream error: {0}")]
    Stream(String),
    /// The server sent an explicit error frame.
    #[error("server reported an error: {0}")]
    Server(String),
}

impl QueryError {
    /// Whether resubmitting the same question may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Stream(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Auth(_) | Self::Server(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Askline not configured: create askline.yaml with an endpoint.")]
    Missing,
    #[error("Askline configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Askline not configured: create askline.yaml with an endpoint.".to_string()
            }
            Self::Invalid(detail) => {
                format!("Askline not configured: {detail}. Update askline.yaml.")
            }
        }
    }
}
