//! Group submission: permits, retries, demultiplexing.
//!
//! Each group is one multi-request wire call. Its outcome is all-or-nothing
//! at the transport level: either the call succeeds and every item is
//! delivered by position, or the whole group is retried and finally failed
//! together. Errors never leave the group.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use metafetch_core::{FetchError, ItemResponse, Strategy, WireRequest};

use super::stats::StatsCounters;
use super::Inner;
use crate::abort::{AttachedGroup, GroupId, MergedId};
use crate::dedup::MergedRequest;
use crate::transport::TransportError;

/// How a group's wire calls ended.
enum Settled {
    Items(Vec<ItemResponse>),
    Failed(FetchError),
    Aborted,
}

impl Settled {
    fn label(&self) -> &'static str {
        match self {
            Self::Items(_) => "ok",
            Self::Failed(_) => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl Inner {
    /// Submits the groups of one flush in order, holding one permit per
    /// in-flight group.
    pub(super) async fn dispatch_in_order(
        self: Arc<Self>,
        strategy: Arc<Strategy>,
        permits: Arc<Semaphore>,
        groups: Vec<AttachedGroup>,
    ) {
        for group in groups {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                // Semaphores are never closed; treat it like a shutdown.
                self.coordinator.finish_group(group.id);
                continue;
            };
            let inner = Arc::clone(&self);
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move {
                inner.submit_group(&strategy, group).await;
                drop(permit);
            });
        }
    }

    async fn submit_group(&self, strategy: &Strategy, group: AttachedGroup) {
        let AttachedGroup {
            id,
            token,
            requests,
        } = group;

        if token.is_cancelled() {
            self.coordinator.finish_group(id);
            return;
        }

        let merged_ids: Vec<MergedId> = requests.iter().map(|(mid, _)| *mid).collect();
        let live = self.coordinator.mark_dispatched(id, &merged_ids);
        let (merged, payload): (Vec<(MergedId, MergedRequest)>, Vec<WireRequest>) = requests
            .into_iter()
            .zip(live)
            .filter(|(_, live)| *live)
            .map(|(entry, _)| {
                let wire = entry.1.wire_request();
                (entry, wire)
            })
            .unzip();

        if payload.is_empty() {
            debug!(group = %id, "every subscriber cancelled before dispatch");
            self.coordinator.finish_group(id);
            return;
        }

        let span = info_span!(
            "dispatch",
            strategy = %strategy.name,
            group = %id,
            size = payload.len(),
            attempts = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let (settled, attempts) = self.call_with_retries(strategy, id, &payload, &token).await;

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let span = tracing::Span::current();
            span.record("attempts", attempts);
            span.record("duration_ms", duration_ms);
            span.record("outcome", settled.label());

            match settled {
                Settled::Items(items) => self.demultiplex(&merged, items),
                Settled::Failed(err) => {
                    StatsCounters::bump(&self.stats.failed_groups, 1);
                    for (mid, _) in &merged {
                        self.coordinator.deliver_merged(*mid, &Err(err.clone()));
                    }
                }
                Settled::Aborted => {
                    debug!(group = %id, "group aborted");
                }
            }
            self.coordinator.finish_group(id);
        }
        .instrument(span)
        .await;
    }

    /// Calls the transport until it succeeds, fails for good, or the group
    /// is aborted. Returns the outcome and the number of wire calls made.
    async fn call_with_retries(
        &self,
        strategy: &Strategy,
        group: GroupId,
        payload: &[WireRequest],
        token: &CancellationToken,
    ) -> (Settled, u32) {
        let max_attempts = strategy.max_attempts();
        let backoff = self.config.retry_backoff();
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return (Settled::Aborted, attempt);
            }
            attempt += 1;
            StatsCounters::bump(&self.stats.wire_calls, 1);
            if attempt > 1 {
                StatsCounters::bump(&self.stats.retries, 1);
            }

            let err = match self.transport.submit_batch(payload, token.clone()).await {
                Ok(items) if items.len() == payload.len() => {
                    return (Settled::Items(items), attempt);
                }
                Ok(items) => {
                    warn!(
                        group = %group,
                        expected = payload.len(),
                        actual = items.len(),
                        "response count does not match request count"
                    );
                    return (
                        Settled::Failed(FetchError::ProtocolMismatch {
                            expected: payload.len(),
                            actual: items.len(),
                        }),
                        attempt,
                    );
                }
                Err(TransportError::Aborted) => return (Settled::Aborted, attempt),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                warn!(group = %group, attempts = attempt, error = %err, "batch failed");
                return (
                    Settled::Failed(FetchError::Transport {
                        message: err.to_string(),
                        attempts: attempt,
                    }),
                    attempt,
                );
            }

            warn!(group = %group, attempt, error = %err, "batch failed, retrying");
            if !backoff.is_zero() {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    /// Matches responses to merged requests by position, writes successful
    /// values to the cache under each live subscriber's key, then delivers.
    fn demultiplex(&self, merged: &[(MergedId, MergedRequest)], items: Vec<ItemResponse>) {
        for ((mid, request), item) in merged.iter().zip(items) {
            let result = match item {
                Ok(value) => {
                    let value = Arc::new(value);
                    // Only subscribers still waiting get their key written;
                    // an abandoned request caches nothing.
                    let live = self.coordinator.live_subscribers(*mid);
                    for subscription in request
                        .subscribers
                        .iter()
                        .filter(|s| live.contains(&s.subscriber))
                    {
                        self.cache
                            .set(subscription.cache_key.clone(), Arc::clone(&value));
                    }
                    Ok(value)
                }
                Err(message) => Err(FetchError::Backend { message }),
            };
            self.coordinator.deliver_merged(*mid, &result);
        }
    }
}
