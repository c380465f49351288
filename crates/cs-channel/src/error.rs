use std::time::Duration;

use cs_harness::CallError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Credentials rejected (401/403). Fatal for a reconciliation run.
    #[error("channel authentication failed: {0}")]
    Auth(String),

    /// 429 from the channel manager.
    #[error("rate limited by channel (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, connection failures and 5xx responses.
    #[error("transient channel error: {0}")]
    Transient(String),

    /// The by-id lookup answered 404.
    #[error("{resource} {external_id} not found at channel")]
    NotFound {
        resource: &'static str,
        external_id: String,
    },

    /// Any other 4xx; retrying will not help.
    #[error("channel rejected request: {status}: {body}")]
    Client { status: u16, body: String },

    #[error("unexpected channel response: {0}")]
    Decode(String),

    #[error("missing channel credentials")]
    MissingCredentials,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::RateLimited { .. } | ChannelError::Transient(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChannelError::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChannelError::NotFound { .. })
    }

    /// Short label used as the `outcome` metric value.
    pub fn outcome(&self) -> &'static str {
        match self {
            ChannelError::Auth(_) => "auth",
            ChannelError::RateLimited { .. } => "rate_limited",
            ChannelError::Transient(_) => "transient",
            ChannelError::NotFound { .. } => "not_found",
            ChannelError::Client { .. } => "client",
            ChannelError::Decode(_) => "decode",
            ChannelError::MissingCredentials => "missing_credentials",
            ChannelError::Http(_) => "http",
        }
    }
}

impl CallError for ChannelError {
    fn is_retryable(&self) -> bool {
        ChannelError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ChannelError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn is_upstream_failure(&self) -> bool {
        !matches!(
            self,
            ChannelError::NotFound { .. } | ChannelError::Client { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
