use std::time::Duration;

/// Structured upstream failure carried from executor to manager.
///
/// `message` is the raw upstream error body when one was read; `retry_after`
/// is populated by the provider's quota classifier when the failure maps to
/// a known cooldown window.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream status {code}: {message}")]
pub struct StatusError {
    pub code: u16,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl StatusError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(501, message)
    }

    /// True when this failure came from a token-refresh endpoint rejecting
    /// the grant outright. Retrying such a refresh can only burn the token
    /// family; callers must surface the error after a single attempt.
    pub fn is_non_retryable_refresh(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        NON_RETRYABLE_REFRESH_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

const NON_RETRYABLE_REFRESH_MARKERS: [&str; 2] = ["refresh_token_reused", "invalid_grant"];

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("{0}")]
    Other(String),
}

impl ExecError {
    pub fn status(&self) -> Option<&StatusError> {
        match self {
            ExecError::Status(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("auth id must not be empty")]
    EmptyAuthId,
    #[error("auth not found: {0}")]
    AuthNotFound(String),
    #[error("no executor registered for provider: {0}")]
    NoExecutor(String),
}
