//! Errors raised by the HTTP client.
//!
//! The collector inspects [`ClientError::is_retryable`] to decide whether to
//! re-issue the same input; everything else aborts the run. Stage functions
//! wrap these in `anyhow::Error` with context.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP 429. The worker has already slept for `wait`.
    #[error("rate limited by {url}, waited {wait:?}")]
    RateLimited { url: String, wait: Duration },

    /// The after-response policy asked for the request to be re-issued.
    #[error("retry requested for {url} (HTTP {status})")]
    Retryable { url: String, status: u16 },

    #[error("authentication failed for {url} (HTTP {status})")]
    Unauthorized { url: String, status: u16 },

    #[error("HTTP {status} from {url}: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    /// The after-response policy classified the response as fatal.
    #[error("response from {url} rejected: {message}")]
    Rejected { url: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("client is shut down")]
    Closed,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Retryable { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }
}
