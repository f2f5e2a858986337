//! Subscriber liveness tracking and cancellation.
//!
//! Every caller is a subscriber with the state machine
//! `Pending -> Delivered | Cancelled`. Terminal subscribers are forgotten, so a
//! second delivery or cancellation finds nothing and is a no-op.
//!
//! After deduplication a subscriber is attached to a merged request, and each
//! merged request to a dispatch group that owns one [`CancellationToken`].
//! The group token fires once a dispatched group has no live merged request
//! left; a response arriving after that is dropped.
//!
//! Sinks are always invoked after the state lock is released, so a callback
//! may re-enter the engine.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use metafetch_core::{FetchError, FetchResult, SubscriberId};

use crate::dedup::MergedRequest;

/// Delivery target for one subscriber; invoked at most once.
pub type Sink = Box<dyn FnOnce(FetchResult) + Send + 'static>;

/// Identifies a merged request within the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergedId(u64);

/// Identifies one dispatch group (one multi-request wire call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Result of [`AbortCoordinator::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Unknown or already terminal subscriber.
    NoOp,
    /// The subscriber had not been flushed yet; the caller must remove it
    /// from its pending queue.
    Queued,
    /// The subscriber was detached from its merged request.
    Detached {
        /// The merged request lost its last subscriber.
        merged_dropped: bool,
        /// The group was in flight and its abort token was fired.
        group_aborted: bool,
    },
}

struct SubscriberSlot {
    sink: Sink,
    merged: Option<MergedId>,
}

struct MergedEntry {
    group: GroupId,
    live: Vec<SubscriberId>,
}

struct GroupEntry {
    live_merged: usize,
    token: CancellationToken,
    dispatched: bool,
}

#[derive(Default)]
struct State {
    next_subscriber: u64,
    next_merged: u64,
    next_group: u64,
    subscribers: HashMap<SubscriberId, SubscriberSlot>,
    merged: HashMap<MergedId, MergedEntry>,
    groups: HashMap<GroupId, GroupEntry>,
}

/// A dedup group registered with the coordinator, ready for dispatch.
pub struct AttachedGroup {
    pub id: GroupId,
    pub token: CancellationToken,
    /// Merged requests that still had at least one live subscriber, in
    /// dedup order.
    pub requests: Vec<(MergedId, MergedRequest)>,
}

/// Tracks every live subscriber and fans results out exactly once.
pub struct AbortCoordinator {
    state: Mutex<State>,
    root: CancellationToken,
}

impl AbortCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            root: CancellationToken::new(),
        }
    }

    /// Registers a new pending subscriber.
    pub fn register(&self, sink: Sink) -> SubscriberId {
        let mut state = self.state.lock();
        state.next_subscriber += 1;
        let id = SubscriberId(state.next_subscriber);
        state
            .subscribers
            .insert(id, SubscriberSlot { sink, merged: None });
        id
    }

    /// Whether `id` is still waiting for a delivery.
    #[must_use]
    pub fn is_pending(&self, id: SubscriberId) -> bool {
        self.state.lock().subscribers.contains_key(&id)
    }

    /// Number of subscribers still waiting for a delivery.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Registers a deduplicated batch as one dispatch group.
    ///
    /// Subscribers cancelled since the flush are skipped; merged requests left
    /// without subscribers are omitted from the result.
    pub fn attach(&self, batch: Vec<MergedRequest>) -> AttachedGroup {
        let mut state = self.state.lock();
        state.next_group += 1;
        let group = GroupId(state.next_group);
        let token = self.root.child_token();

        let mut requests = Vec::with_capacity(batch.len());
        for mut request in batch {
            request
                .subscribers
                .retain(|s| state.subscribers.contains_key(&s.subscriber));
            if request.subscribers.is_empty() {
                continue;
            }

            state.next_merged += 1;
            let merged = MergedId(state.next_merged);
            let live: Vec<SubscriberId> =
                request.subscribers.iter().map(|s| s.subscriber).collect();
            for id in &live {
                if let Some(slot) = state.subscribers.get_mut(id) {
                    slot.merged = Some(merged);
                }
            }
            state.merged.insert(merged, MergedEntry { group, live });
            requests.push((merged, request));
        }

        state.groups.insert(
            group,
            GroupEntry {
                live_merged: requests.len(),
                token: token.clone(),
                dispatched: false,
            },
        );

        AttachedGroup {
            id: group,
            token,
            requests,
        }
    }

    /// Marks a group as in flight and reports which merged requests are
    /// still live, positionally.
    ///
    /// A group with no live merged request is not marked; the caller must not
    /// submit it.
    pub fn mark_dispatched(&self, group: GroupId, merged: &[MergedId]) -> Vec<bool> {
        let mut state = self.state.lock();
        let live: Vec<bool> = merged
            .iter()
            .map(|id| state.merged.contains_key(id))
            .collect();
        if live.iter().any(|l| *l) {
            if let Some(entry) = state.groups.get_mut(&group) {
                entry.dispatched = true;
            }
        }
        live
    }

    /// Subscribers of a merged request still waiting for delivery, in
    /// submission order. Empty once the request was delivered or every
    /// subscriber cancelled.
    #[must_use]
    pub fn live_subscribers(&self, merged: MergedId) -> Vec<SubscriberId> {
        self.state
            .lock()
            .merged
            .get(&merged)
            .map(|entry| entry.live.clone())
            .unwrap_or_default()
    }

    /// Cancels one subscriber.
    pub fn cancel(&self, id: SubscriberId) -> CancelOutcome {
        let (outcome, sink) = {
            let mut state = self.state.lock();
            let Some(slot) = state.subscribers.remove(&id) else {
                return CancelOutcome::NoOp;
            };
            let outcome = match slot.merged {
                None => CancelOutcome::Queued,
                Some(merged) => Self::detach(&mut state, id, merged),
            };
            (outcome, slot.sink)
        };
        // The sink may own resources whose drop re-enters the engine.
        drop(sink);
        debug!(subscriber = %id, ?outcome, "subscriber cancelled");
        outcome
    }

    fn detach(state: &mut State, id: SubscriberId, merged: MergedId) -> CancelOutcome {
        let Some(entry) = state.merged.get_mut(&merged) else {
            return CancelOutcome::Detached {
                merged_dropped: false,
                group_aborted: false,
            };
        };
        entry.live.retain(|s| *s != id);
        if !entry.live.is_empty() {
            return CancelOutcome::Detached {
                merged_dropped: false,
                group_aborted: false,
            };
        }

        let group = entry.group;
        state.merged.remove(&merged);
        let mut group_aborted = false;
        if let Some(g) = state.groups.get_mut(&group) {
            g.live_merged = g.live_merged.saturating_sub(1);
            if g.live_merged == 0 && g.dispatched {
                g.token.cancel();
                group_aborted = true;
            }
        }
        CancelOutcome::Detached {
            merged_dropped: true,
            group_aborted,
        }
    }

    /// Delivers a result to one subscriber. No-op if it is already terminal.
    pub fn deliver(&self, id: SubscriberId, result: FetchResult) -> bool {
        let slot = self.state.lock().subscribers.remove(&id);
        match slot {
            Some(slot) => {
                (slot.sink)(result);
                true
            }
            None => false,
        }
    }

    /// Delivers one result to every live subscriber of a merged request, in
    /// submission order. Returns the number of deliveries made.
    pub fn deliver_merged(&self, merged: MergedId, result: &FetchResult) -> usize {
        let sinks: Vec<Sink> = {
            let mut state = self.state.lock();
            let Some(entry) = state.merged.remove(&merged) else {
                return 0;
            };
            if let Some(g) = state.groups.get_mut(&entry.group) {
                g.live_merged = g.live_merged.saturating_sub(1);
            }
            entry
                .live
                .iter()
                .filter_map(|id| state.subscribers.remove(id))
                .map(|slot| slot.sink)
                .collect()
        };
        let delivered = sinks.len();
        for sink in sinks {
            sink(result.clone());
        }
        delivered
    }

    /// Forgets a group once its wire call has settled.
    ///
    /// Any merged request still holding live subscribers at this point (the
    /// group was aborted by shutdown) is delivered `Closed`.
    pub fn finish_group(&self, group: GroupId) {
        let leftovers: Vec<MergedId> = {
            let mut state = self.state.lock();
            state.groups.remove(&group);
            state
                .merged
                .iter()
                .filter(|(_, entry)| entry.group == group)
                .map(|(id, _)| *id)
                .collect()
        };
        for merged in leftovers {
            self.deliver_merged(merged, &Err(FetchError::Closed));
        }
    }

    /// Aborts every group, including ones not yet dispatched.
    pub fn abort_all(&self) {
        self.root.cancel();
    }
}

impl Default for AbortCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metafetch_core::RequestDescriptor;
    use serde_json::json;

    use super::*;
    use crate::dedup::Deduplicator;

    type Log = Arc<Mutex<Vec<(SubscriberId, FetchResult)>>>;

    fn recording_sink(log: &Log, tag: u64) -> Sink {
        let log = log.clone();
        Box::new(move |result| log.lock().push((SubscriberId(tag), result)))
    }

    fn register_n(coordinator: &AbortCoordinator, log: &Log, n: u64) -> Vec<SubscriberId> {
        (1..=n)
            .map(|tag| coordinator.register(recording_sink(log, tag)))
            .collect()
    }

    fn merged_for(ids: &[SubscriberId], body: &str) -> Vec<MergedRequest> {
        let descriptors = ids
            .iter()
            .map(|id| RequestDescriptor::new("idx", body, *id))
            .collect();
        Deduplicator::merge(descriptors).0
    }

    #[test]
    fn deliver_is_exactly_once() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 1);

        assert!(coordinator.deliver(ids[0], Ok(Arc::new(json!(1)))));
        assert!(!coordinator.deliver(ids[0], Ok(Arc::new(json!(2)))));
        assert_eq!(log.lock().len(), 1);
        assert_eq!(coordinator.cancel(ids[0]), CancelOutcome::NoOp);
    }

    #[test]
    fn cancel_before_flush_reports_queued() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 1);

        assert_eq!(coordinator.cancel(ids[0]), CancelOutcome::Queued);
        assert_eq!(coordinator.cancel(ids[0]), CancelOutcome::NoOp);
        assert!(!coordinator.deliver(ids[0], Err(FetchError::Closed)));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn attach_skips_subscribers_cancelled_after_flush() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 2);
        let batch = merged_for(&ids[..1], "{\"a\":1}")
            .into_iter()
            .chain(merged_for(&ids[1..], "{\"b\":1}"))
            .collect();

        coordinator.cancel(ids[0]);
        let group = coordinator.attach(batch);

        assert_eq!(group.requests.len(), 1);
        assert_eq!(group.requests[0].1.representative.subscriber, ids[1]);
    }

    #[test]
    fn cancelling_one_co_subscriber_keeps_the_other() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 2);
        let group = coordinator.attach(merged_for(&ids, "{}"));
        let merged = group.requests[0].0;
        coordinator.mark_dispatched(group.id, &[merged]);

        let outcome = coordinator.cancel(ids[0]);
        assert_eq!(
            outcome,
            CancelOutcome::Detached {
                merged_dropped: false,
                group_aborted: false
            }
        );
        assert!(!group.token.is_cancelled());

        assert_eq!(coordinator.live_subscribers(merged), vec![ids[1]]);

        let delivered = coordinator.deliver_merged(merged, &Ok(Arc::new(json!({"n": 7}))));
        assert_eq!(delivered, 1);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, SubscriberId(2));
    }

    #[test]
    fn last_cancel_before_dispatch_drops_without_abort() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 1);
        let group = coordinator.attach(merged_for(&ids, "{}"));
        let merged = group.requests[0].0;

        let outcome = coordinator.cancel(ids[0]);
        assert_eq!(
            outcome,
            CancelOutcome::Detached {
                merged_dropped: true,
                group_aborted: false
            }
        );
        assert!(!group.token.is_cancelled());
        assert_eq!(coordinator.mark_dispatched(group.id, &[merged]), vec![false]);
    }

    #[test]
    fn last_cancel_after_dispatch_fires_group_token() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 2);
        let batch = merged_for(&ids[..1], "1")
            .into_iter()
            .chain(merged_for(&ids[1..], "2"))
            .collect();
        let group = coordinator.attach(batch);
        let merged: Vec<MergedId> = group.requests.iter().map(|(id, _)| *id).collect();
        assert_eq!(coordinator.mark_dispatched(group.id, &merged), vec![true, true]);

        coordinator.cancel(ids[0]);
        assert!(!group.token.is_cancelled());
        let outcome = coordinator.cancel(ids[1]);
        assert_eq!(
            outcome,
            CancelOutcome::Detached {
                merged_dropped: true,
                group_aborted: true
            }
        );
        assert!(group.token.is_cancelled());

        // A late response is discarded.
        assert!(coordinator.live_subscribers(merged[0]).is_empty());
        assert_eq!(coordinator.deliver_merged(merged[0], &Ok(Arc::new(json!(1)))), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn finish_group_closes_leftover_subscribers() {
        let coordinator = AbortCoordinator::new();
        let log: Log = Arc::default();
        let ids = register_n(&coordinator, &log, 1);
        let group = coordinator.attach(merged_for(&ids, "{}"));

        coordinator.abort_all();
        assert!(group.token.is_cancelled());
        coordinator.finish_group(group.id);

        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, Err(FetchError::Closed));
        assert_eq!(coordinator.pending_count(), 0);
    }
}
