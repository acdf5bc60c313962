use std::time::Duration;

use thiserror::Error;

/// Classified outcome of a failed API call.
///
/// Classification happens once, at the transport boundary; retry logic and
/// the poller only ever look at the variant, never at message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The response was not JSON (e.g. an intercepting proxy's HTML page).
    #[error("malformed response body (status {status}): {snippet}")]
    MalformedBody { status: u16, snippet: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Failures that happened below the application protocol.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connection(_)
                | TransportError::MalformedBody { .. }
        )
    }

    /// Transport-level failures and 5xx responses may be retried.
    pub fn is_retryable(&self) -> bool {
        self.is_transport_level() || matches!(self, TransportError::Server { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Unauthorized => Some(401),
            TransportError::NotFound => Some(404),
            TransportError::MalformedBody { status, .. }
            | TransportError::Validation { status, .. }
            | TransportError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}
