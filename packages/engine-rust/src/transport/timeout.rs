//! Timeout decorator for transports.
//!
//! Fails a wire call with `TransportError::Timeout` when it exceeds a fixed
//! duration. The scheduler then treats it like any other transport failure
//! and retries according to the strategy.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use metafetch_core::{ItemResponse, WireRequest};

use super::{TransportClient, TransportError};

/// Wraps a transport with a per-call timeout.
#[derive(Debug, Clone)]
pub struct TimeoutTransport<T> {
    inner: T,
    timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    #[must_use]
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<T: TransportClient> TransportClient for TimeoutTransport<T> {
    async fn submit_batch(
        &self,
        requests: &[WireRequest],
        abort: CancellationToken,
    ) -> Result<Vec<ItemResponse>, TransportError> {
        // The inner call sees a child token so an expired call is told to stop.
        let child = abort.child_token();
        let fut = self.inner.submit_batch(requests, child.clone());
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                child.cancel();
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.timeout.as_millis() as u64;
                Err(TransportError::Timeout { timeout_ms })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Transport that takes a configurable delay before responding.
    struct SlowTransport {
        delay_ms: u64,
    }

    #[async_trait]
    impl TransportClient for SlowTransport {
        async fn submit_batch(
            &self,
            requests: &[WireRequest],
            _abort: CancellationToken,
        ) -> Result<Vec<ItemResponse>, TransportError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(requests.iter().map(|_| Ok(json!({"ok": true}))).collect())
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let transport = TimeoutTransport::new(
            SlowTransport { delay_ms: 10 },
            Duration::from_millis(1000),
        );
        let items = transport
            .submit_batch(&[WireRequest::new("a", "{}")], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_error() {
        let transport = TimeoutTransport::new(
            SlowTransport { delay_ms: 200 },
            Duration::from_millis(50),
        );
        let err = transport
            .submit_batch(&[WireRequest::new("a", "{}")], CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout { timeout_ms: 50 });
    }
}
