//! Intra-batch deduplication.
//!
//! Collapses descriptors sharing a [`RequestKey`] into one [`MergedRequest`],
//! so at most one wire-level body is sent per distinct
//! `(target_resource, body)` within a dispatch cycle.
//!
//! [`RequestKey`]: metafetch_core::RequestKey

use std::collections::HashMap;

use metafetch_core::{RequestDescriptor, SubscriberId, WireRequest};

/// A caller waiting on a merged request, with the cache key its result is
/// written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscriber: SubscriberId,
    pub cache_key: String,
}

/// One wire-level request standing in for one or more identical callers.
///
/// `subscribers` is never empty and lists callers in submission order; the
/// representative's own subscription comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRequest {
    pub representative: RequestDescriptor,
    pub subscribers: Vec<Subscription>,
}

impl MergedRequest {
    fn new(representative: RequestDescriptor) -> Self {
        let subscribers = vec![Subscription {
            subscriber: representative.subscriber,
            cache_key: representative.cache_key.clone(),
        }];
        Self {
            representative,
            subscribers,
        }
    }

    /// The body actually placed on the wire.
    #[must_use]
    pub fn wire_request(&self) -> WireRequest {
        WireRequest::new(
            self.representative.target_resource.clone(),
            self.representative.body.clone(),
        )
    }
}

/// Totals reported for one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DedupStats {
    pub total: usize,
    pub unique: usize,
}

impl DedupStats {
    /// Callers that piggybacked on another caller's request.
    #[must_use]
    pub fn collapsed(&self) -> usize {
        self.total - self.unique
    }
}

/// Stateless collapsing of identical descriptors.
pub struct Deduplicator;

impl Deduplicator {
    /// Groups `descriptors` by key.
    ///
    /// The first descriptor of each key becomes the representative; output
    /// order is the order in which each distinct key first appears.
    #[must_use]
    pub fn merge(descriptors: Vec<RequestDescriptor>) -> (Vec<MergedRequest>, DedupStats) {
        let total = descriptors.len();
        let mut merged: Vec<MergedRequest> = Vec::new();
        let mut index_by_key = HashMap::with_capacity(total);

        for descriptor in descriptors {
            match index_by_key.get(&descriptor.key) {
                Some(&idx) => {
                    let entry: &mut MergedRequest = &mut merged[idx];
                    entry.subscribers.push(Subscription {
                        subscriber: descriptor.subscriber,
                        cache_key: descriptor.cache_key,
                    });
                }
                None => {
                    index_by_key.insert(descriptor.key.clone(), merged.len());
                    merged.push(MergedRequest::new(descriptor));
                }
            }
        }

        let stats = DedupStats {
            total,
            unique: merged.len(),
        };
        (merged, stats)
    }

    /// Merges a whole flush, then cuts the merged requests into wire calls of
    /// at most `batch_size` bodies.
    ///
    /// Merging first means a distinct `(target_resource, body)` is sent at
    /// most once per flush however many batches the flush yields.
    #[must_use]
    pub fn merge_into_batches(
        descriptors: Vec<RequestDescriptor>,
        batch_size: usize,
    ) -> (Vec<Vec<MergedRequest>>, DedupStats) {
        let (merged, stats) = Self::merge(descriptors);
        let batch_size = batch_size.max(1);
        let mut batches = Vec::with_capacity(merged.len().div_ceil(batch_size));
        let mut merged = merged.into_iter().peekable();
        while merged.peek().is_some() {
            batches.push(merged.by_ref().take(batch_size).collect());
        }
        (batches, stats)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn desc(target: &str, body: &str, id: u64) -> RequestDescriptor {
        RequestDescriptor::new(target, body, SubscriberId(id))
    }

    #[test]
    fn identical_requests_collapse_into_one() {
        let (merged, stats) = Deduplicator::merge(vec![
            desc("a", "{\"q\":1}", 1),
            desc("a", "{\"q\":1}", 2),
            desc("a", "{\"q\":1}", 3),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].representative.subscriber, SubscriberId(1));
        let ids: Vec<_> = merged[0].subscribers.iter().map(|s| s.subscriber).collect();
        assert_eq!(ids, vec![SubscriberId(1), SubscriberId(2), SubscriberId(3)]);
        assert_eq!(stats.collapsed(), 2);
    }

    #[test]
    fn same_body_on_different_targets_stays_separate() {
        let (merged, _) = Deduplicator::merge(vec![desc("a", "{}", 1), desc("b", "{}", 2)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn output_follows_first_appearance() {
        let (merged, _) = Deduplicator::merge(vec![
            desc("a", "2", 1),
            desc("a", "1", 2),
            desc("a", "2", 3),
            desc("a", "3", 4),
            desc("a", "1", 5),
        ]);
        let bodies: Vec<_> = merged.iter().map(|m| m.representative.body.as_str()).collect();
        assert_eq!(bodies, vec!["2", "1", "3"]);
    }

    #[test]
    fn aliased_cache_keys_are_kept_per_subscriber() {
        let (merged, _) = Deduplicator::merge(vec![
            desc("a", "{}", 1).with_cache_key("dash1"),
            desc("a", "{}", 2).with_cache_key("dash2"),
        ]);
        let keys: Vec<_> = merged[0].subscribers.iter().map(|s| s.cache_key.as_str()).collect();
        assert_eq!(keys, vec!["dash1", "dash2"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let (merged, stats) = Deduplicator::merge(Vec::new());
        assert!(merged.is_empty());
        assert_eq!(stats, DedupStats::default());
    }

    #[test]
    fn duplicates_across_batch_boundaries_are_sent_once() {
        let (batches, stats) = Deduplicator::merge_into_batches(
            vec![
                desc("logs", "{\"q\":1}", 1),
                desc("logs", "{\"q\":1}", 2),
                desc("logs", "{\"q\":1}", 3),
                desc("logs", "{\"q\":2}", 4),
            ],
            2,
        );
        assert_eq!(batches.len(), 1);
        let bodies: Vec<_> = batches[0]
            .iter()
            .map(|m| m.representative.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["{\"q\":1}", "{\"q\":2}"]);
        assert_eq!(batches[0][0].subscribers.len(), 3);
        assert_eq!(stats.collapsed(), 2);
    }

    #[test]
    fn batches_hold_at_most_batch_size_distinct_bodies() {
        let descriptors = (0..7).map(|i| desc("a", &i.to_string(), i)).collect();
        let (batches, _) = Deduplicator::merge_into_batches(descriptors, 3);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn grouped_resources_stay_contiguous_across_batches() {
        let (batches, _) = Deduplicator::merge_into_batches(
            vec![desc("A", "1", 1), desc("A", "3", 3), desc("B", "2", 2), desc("B", "4", 4)],
            2,
        );
        let shape: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|m| m.representative.target_resource.as_str()).collect())
            .collect();
        assert_eq!(shape, vec![vec!["A", "A"], vec!["B", "B"]]);
    }

    proptest! {
        #[test]
        fn every_subscriber_is_kept_exactly_once(bodies in prop::collection::vec(0u8..5, 0..40)) {
            let descriptors: Vec<_> = bodies
                .iter()
                .enumerate()
                .map(|(i, b)| desc("idx", &b.to_string(), i as u64))
                .collect();

            let (merged, stats) = Deduplicator::merge(descriptors);

            let mut distinct = bodies.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(merged.len(), distinct.len());
            prop_assert_eq!(stats.unique, distinct.len());

            let mut seen: Vec<u64> = merged
                .iter()
                .flat_map(|m| m.subscribers.iter().map(|s| s.subscriber.0))
                .collect();
            seen.sort_unstable();
            let expected: Vec<u64> = (0..bodies.len() as u64).collect();
            prop_assert_eq!(seen, expected);

            for m in &merged {
                prop_assert!(!m.subscribers.is_empty());
                prop_assert!(m.subscribers.windows(2).all(|w| w[0].subscriber < w[1].subscriber));
                prop_assert_eq!(m.subscribers[0].subscriber, m.representative.subscriber);
            }
        }
    }
}
