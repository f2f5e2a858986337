//! The seam between the scheduler and the search backend.
//!
//! - [`TransportClient`]: submit N bodies, receive N per-item outcomes in order
//! - [`http`]: `reqwest`-backed multi-search transport
//! - [`timeout`]: per-call timeout decorator for any transport

pub mod http;
pub mod timeout;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use metafetch_core::{ItemResponse, WireRequest};

pub use http::MsearchTransport;
pub use timeout::TimeoutTransport;

/// Failure of a whole multi-request wire call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never produced an HTTP response (connect, TLS, I/O).
    #[error("request failed: {0}")]
    Request(String),
    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The batch could not be encoded for the wire. Resubmitting the same
    /// payload fails the same way.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The call did not complete within the configured timeout.
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The abort token fired before the call completed.
    #[error("call aborted")]
    Aborted,
}

impl TransportError {
    /// Whether the scheduler should resubmit the same group.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Aborted | Self::InvalidPayload(_))
    }
}

/// Performs multi-request wire calls.
///
/// Implementations must return exactly one [`ItemResponse`] per submitted
/// request, in submission order; the scheduler treats any other length as a
/// protocol violation. `abort` is cancelled once no caller is waiting for the
/// batch any more. Honoring it is best effort.
#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    async fn submit_batch(
        &self,
        requests: &[WireRequest],
        abort: CancellationToken,
    ) -> Result<Vec<ItemResponse>, TransportError>;
}

#[async_trait]
impl<T: TransportClient + ?Sized> TransportClient for std::sync::Arc<T> {
    async fn submit_batch(
        &self,
        requests: &[WireRequest],
        abort: CancellationToken,
    ) -> Result<Vec<ItemResponse>, TransportError> {
        (**self).submit_batch(requests, abort).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_and_unencodable_calls_are_not_retried() {
        assert!(!TransportError::Aborted.is_retryable());
        assert!(!TransportError::InvalidPayload("not json".to_string()).is_retryable());
        assert!(TransportError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(TransportError::Malformed("eof".to_string()).is_retryable());
        assert!(TransportError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
    }
}
