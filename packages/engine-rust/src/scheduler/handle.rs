//! Caller-side handles returned by the scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use metafetch_core::{FetchError, FetchResult, SubscriberId};

use super::Inner;
use crate::abort::CancelOutcome;

/// Future resolving to one request's result.
///
/// Dropping the handle before it resolves cancels the request, exactly like
/// [`RequestHandle::cancel`].
pub struct RequestHandle {
    id: SubscriberId,
    rx: oneshot::Receiver<FetchResult>,
    inner: Arc<Inner>,
    settled: bool,
}

impl RequestHandle {
    pub(super) fn new(
        id: SubscriberId,
        rx: oneshot::Receiver<FetchResult>,
        inner: Arc<Inner>,
    ) -> Self {
        Self {
            id,
            rx,
            inner,
            settled: false,
        }
    }

    /// The subscriber id assigned to this request.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Cancels the request. A no-op once the result has been delivered.
    pub fn cancel(mut self) -> CancelOutcome {
        self.settled = true;
        self.inner.cancel(self.id)
    }
}

impl Future for RequestHandle {
    type Output = FetchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.settled = true;
                // A dropped sender means the engine went away without delivering.
                Poll::Ready(result.unwrap_or(Err(FetchError::Closed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.cancel(self.id);
        }
    }
}

/// Cancellation handle for callback-style requests.
///
/// Dropping it does not cancel the request.
#[derive(Clone)]
pub struct CancelHandle {
    id: SubscriberId,
    inner: Arc<Inner>,
}

impl CancelHandle {
    pub(super) fn new(id: SubscriberId, inner: Arc<Inner>) -> Self {
        Self { id, inner }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Cancels the request. The callback will not run unless it already has.
    pub fn cancel(&self) -> CancelOutcome {
        self.inner.cancel(self.id)
    }
}
