//! Lock-free counters for scheduler telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Requests accepted into a queue.
    pub requests: u64,
    /// Requests answered from the result cache without queueing.
    pub cache_hits: u64,
    /// Requests that shared another request's wire body.
    pub deduplicated: u64,
    /// Wire calls made, retries included.
    pub wire_calls: u64,
    /// Wire calls that were retries.
    pub retries: u64,
    /// Groups that ended with an error delivered to every subscriber.
    pub failed_groups: u64,
    /// Subscribers cancelled before delivery.
    pub cancelled: u64,
}

impl SchedulerStats {
    /// Share of requests that did not need their own wire body.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dedup_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.deduplicated as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub deduplicated: AtomicU64,
    pub wire_calls: AtomicU64,
    pub retries: AtomicU64,
    pub failed_groups: AtomicU64,
    pub cancelled: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            wire_calls: self.wire_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed_groups: self.failed_groups.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ratio_handles_zero_requests() {
        assert!(SchedulerStats::default().dedup_ratio().abs() < f64::EPSILON);
        let stats = SchedulerStats {
            requests: 4,
            deduplicated: 1,
            ..SchedulerStats::default()
        };
        assert!((stats.dedup_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.requests, 3);
        StatsCounters::bump(&counters.retries, 1);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.wire_calls, 0);
    }
}
