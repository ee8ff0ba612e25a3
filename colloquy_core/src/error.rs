use std::time::Duration;
use thiserror::Error;

/// Failures raised by the completion transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("no stream data received for {}s", .0.as_secs())]
    StallTimeout(Duration),

    #[error("malformed stream chunk: {0}")]
    StreamParse(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Connection failures and 5xx responses are worth another attempt;
    /// everything else is either the caller's fault or already partially
    /// delivered.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::Timeout(_)
            | Self::StallTimeout(_)
            | Self::StreamParse(_)
            | Self::InvalidResponse(_) => false,
        }
    }
}
