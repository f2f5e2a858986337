//! Strategy-driven batch scheduler.
//!
//! Request lifecycle:
//!
//! 1. **Enqueue** (`request*`): the body is serialized (failures are returned
//!    synchronously), a subscriber is registered with the
//!    [`AbortCoordinator`], and the descriptor joins the pending queue of the
//!    strategy its request class resolves to.
//! 2. **Flush**: the first enqueue of a cycle arms a timer
//!    (`flush_delay_ms`, or one cooperative yield when zero). Once the queue
//!    holds `batch_size` distinct target resources the flush is brought
//!    forward to the next yield, so requests still being enqueued in the
//!    same burst join it. An explicit [`BatchScheduler::flush`] or the
//!    optional eager threshold flushes at once. Flushing drains the queue
//!    grouped by target resource.
//! 3. **Dedup + attach**: the drained requests are collapsed by the
//!    [`Deduplicator`], cut into `batch_size` chunks of merged requests and
//!    each chunk is registered with the coordinator as one dispatch group.
//! 4. **Dispatch** ([`dispatch`]): a per-flush loop takes one of the
//!    strategy's `parallel_requests` permits per group, in readiness order,
//!    and submits it; failed groups are retried whole.
//! 5. **Demux**: responses are matched to merged requests by position,
//!    written to the [`ResultCache`] and delivered.
//!
//! [`AbortCoordinator`]: crate::abort::AbortCoordinator
//! [`Deduplicator`]: crate::dedup::Deduplicator

mod dispatch;
mod handle;
mod stats;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, trace};

use metafetch_core::{
    derive_key, FetchError, FetchResult, RequestDescriptor, Strategy, SubscriberId,
};

use crate::abort::{AbortCoordinator, AttachedGroup, CancelOutcome, Sink};
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::queue::PendingQueue;
use crate::transport::TransportClient;

pub use handle::{CancelHandle, RequestHandle};
pub use stats::SchedulerStats;

use stats::StatsCounters;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Cache key the result is written under instead of the request key.
    pub cache_key: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn cache_key(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// Queue, timer state and concurrency permits for one strategy.
struct Lane {
    strategy: Arc<Strategy>,
    queue: PendingQueue,
    /// Bumped by every flush; a timer armed in an earlier cycle is stale.
    cycle: u64,
    timer_armed: bool,
    /// The resource-count trigger already scheduled a yield flush.
    ready_armed: bool,
    permits: Arc<Semaphore>,
}

impl Lane {
    fn new(strategy: &Strategy) -> Self {
        Self {
            strategy: Arc::new(strategy.clone()),
            queue: PendingQueue::new(),
            cycle: 0,
            timer_armed: false,
            ready_armed: false,
            permits: Arc::new(Semaphore::new(strategy.parallel_requests)),
        }
    }
}

enum AfterEnqueue {
    FlushNow,
    Arm {
        cycle: u64,
        timer: bool,
        ready: bool,
    },
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    config: EngineConfig,
    transport: Arc<dyn TransportClient>,
    cache: Arc<ResultCache>,
    coordinator: AbortCoordinator,
    lanes: Mutex<HashMap<String, Lane>>,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl Inner {
    fn enqueue(
        self: &Arc<Self>,
        class: &str,
        target_resource: &str,
        body: String,
        options: RequestOptions,
        sink: Sink,
    ) -> Result<SubscriberId, FetchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FetchError::Closed);
        }
        let strategy = self
            .config
            .strategies
            .resolve(class)
            .ok_or_else(|| FetchError::UnknownStrategy {
                class: class.to_string(),
            })?;

        let id = self.coordinator.register(sink);
        let mut descriptor = RequestDescriptor::new(target_resource, body, id);
        if let Some(cache_key) = options.cache_key {
            descriptor = descriptor.with_cache_key(cache_key);
        }

        let action = {
            let mut lanes = self.lanes.lock();
            // Re-checked under the lock: `close` drains lanes while holding it.
            if self.closed.load(Ordering::Acquire) {
                None
            } else {
                let lane = lanes
                    .entry(strategy.name.clone())
                    .or_insert_with(|| Lane::new(strategy));
                let pending = lane.queue.enqueue(descriptor);
                let eager = self
                    .config
                    .eager_flush_threshold
                    .is_some_and(|threshold| pending >= threshold);
                Some(if eager {
                    AfterEnqueue::FlushNow
                } else {
                    let timer = !lane.timer_armed;
                    lane.timer_armed = true;
                    // A zero delay already flushes on the next yield.
                    let ready = !lane.ready_armed
                        && !self.config.flush_delay().is_zero()
                        && lane.queue.group_count() >= lane.strategy.batch_size;
                    lane.ready_armed |= ready;
                    AfterEnqueue::Arm {
                        cycle: lane.cycle,
                        timer,
                        ready,
                    }
                })
            }
        };

        let Some(action) = action else {
            self.coordinator.cancel(id);
            return Err(FetchError::Closed);
        };

        StatsCounters::bump(&self.stats.requests, 1);
        trace!(subscriber = %id, class, target = target_resource, strategy = %strategy.name, "request enqueued");
        match action {
            AfterEnqueue::FlushNow => self.flush_lane(&strategy.name, None),
            AfterEnqueue::Arm {
                cycle,
                timer,
                ready,
            } => {
                if timer {
                    self.arm_timer(&strategy.name, cycle, self.config.flush_delay());
                }
                if ready {
                    trace!(strategy = %strategy.name, "resource count reached batch size");
                    self.arm_timer(&strategy.name, cycle, Duration::ZERO);
                }
            }
        }
        Ok(id)
    }

    fn arm_timer(self: &Arc<Self>, lane: &str, cycle: u64, delay: Duration) {
        let inner = Arc::clone(self);
        let lane = lane.to_string();
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            inner.flush_lane(&lane, Some(cycle));
        });
    }

    /// Drains one lane and hands its groups to a dispatch loop.
    ///
    /// With `cycle` set, the flush only happens if the lane has not been
    /// flushed since that cycle began.
    fn flush_lane(self: &Arc<Self>, lane_name: &str, cycle: Option<u64>) {
        let drained = {
            let mut lanes = self.lanes.lock();
            let Some(lane) = lanes.get_mut(lane_name) else {
                return;
            };
            if cycle.is_some_and(|c| c != lane.cycle) {
                return;
            }
            lane.cycle += 1;
            lane.timer_armed = false;
            lane.ready_armed = false;
            if lane.queue.is_empty() {
                return;
            }
            let resources = lane.queue.group_count();
            let oldest = lane.queue.oldest();
            (
                lane.queue.drain(),
                resources,
                oldest,
                Arc::clone(&lane.strategy),
                Arc::clone(&lane.permits),
            )
        };
        let (pending, resources, oldest, strategy, permits) = drained;
        let (batches, dedup) = Deduplicator::merge_into_batches(pending, strategy.batch_size);
        StatsCounters::bump(&self.stats.deduplicated, dedup.collapsed() as u64);

        #[allow(clippy::cast_possible_truncation)]
        let waited_ms = oldest.map_or(0, |t| t.elapsed().as_millis() as u64);
        debug!(
            strategy = %strategy.name,
            batches = batches.len(),
            requests = dedup.total,
            unique = dedup.unique,
            resources,
            waited_ms,
            "flushing pending requests"
        );

        let groups: Vec<AttachedGroup> = batches
            .into_iter()
            .map(|batch| self.coordinator.attach(batch))
            .collect();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.dispatch_in_order(strategy, permits, groups).await;
        });
    }

    fn flush_all(self: &Arc<Self>) {
        let names: Vec<String> = self.lanes.lock().keys().cloned().collect();
        for name in names {
            self.flush_lane(&name, None);
        }
    }

    fn cancel(&self, id: SubscriberId) -> CancelOutcome {
        let outcome = self.coordinator.cancel(id);
        match outcome {
            CancelOutcome::NoOp => {}
            CancelOutcome::Queued => {
                let mut lanes = self.lanes.lock();
                for lane in lanes.values_mut() {
                    if lane.queue.remove(id).is_some() {
                        break;
                    }
                }
                StatsCounters::bump(&self.stats.cancelled, 1);
            }
            CancelOutcome::Detached { .. } => StatsCounters::bump(&self.stats.cancelled, 1),
        }
        outcome
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let queued: Vec<SubscriberId> = {
            let mut lanes = self.lanes.lock();
            lanes
                .values_mut()
                .flat_map(|lane| lane.queue.drain())
                .map(|d| d.subscriber)
                .collect()
        };
        debug!(queued = queued.len(), "closing scheduler");
        for id in queued {
            self.coordinator.deliver(id, Err(FetchError::Closed));
        }
        self.coordinator.abort_all();
    }
}

// ---------------------------------------------------------------------------
// BatchScheduler
// ---------------------------------------------------------------------------

/// Coalesces, batches and dispatches meta-fetch requests.
///
/// Cheap to clone; clones share queues, cache and transport. All request
/// methods must be called from within a Tokio runtime because flushing spawns
/// tasks.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    /// Creates a scheduler with its own, empty result cache.
    pub fn new(config: EngineConfig, transport: impl TransportClient) -> Self {
        Self::with_cache(config, transport, Arc::new(ResultCache::new()))
    }

    /// Creates a scheduler writing into a shared result cache.
    pub fn with_cache(
        config: EngineConfig,
        transport: impl TransportClient,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
                cache,
                coordinator: AbortCoordinator::new(),
                lanes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Queues a request and returns a future for its result.
    ///
    /// # Errors
    ///
    /// Fails synchronously with [`FetchError::Serialization`] if `body`
    /// cannot be serialized, [`FetchError::UnknownStrategy`] if no strategy
    /// applies, or [`FetchError::Closed`] after [`close`](Self::close).
    pub fn request<T: Serialize + ?Sized>(
        &self,
        class: &str,
        target_resource: &str,
        body: &T,
    ) -> Result<RequestHandle, FetchError> {
        self.request_with(class, target_resource, body, RequestOptions::default())
    }

    /// [`request`](Self::request) with per-request options.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub fn request_with<T: Serialize + ?Sized>(
        &self,
        class: &str,
        target_resource: &str,
        body: &T,
        options: RequestOptions,
    ) -> Result<RequestHandle, FetchError> {
        let body = serde_json::to_string(body)?;
        self.request_serialized(class, target_resource, body, options)
    }

    fn request_serialized(
        &self,
        class: &str,
        target_resource: &str,
        body: String,
        options: RequestOptions,
    ) -> Result<RequestHandle, FetchError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.enqueue(
            class,
            target_resource,
            body,
            options,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        Ok(RequestHandle::new(id, rx, Arc::clone(&self.inner)))
    }

    /// Queues a request whose result is handed to `callback`.
    ///
    /// The callback runs exactly once unless the request is cancelled first.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request). On error the callback is dropped
    /// without being called.
    pub fn request_with_callback<T, F>(
        &self,
        class: &str,
        target_resource: &str,
        body: &T,
        options: RequestOptions,
        callback: F,
    ) -> Result<CancelHandle, FetchError>
    where
        T: Serialize + ?Sized,
        F: FnOnce(FetchResult) + Send + 'static,
    {
        let body = serde_json::to_string(body)?;
        let id = self
            .inner
            .enqueue(class, target_resource, body, options, Box::new(callback))?;
        Ok(CancelHandle::new(id, Arc::clone(&self.inner)))
    }

    /// Answers from the result cache when possible, otherwise queues the
    /// request. The cache key is `options.cache_key` or the derived request
    /// key.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub fn get_or_request<T: Serialize + ?Sized>(
        &self,
        class: &str,
        target_resource: &str,
        body: &T,
        options: RequestOptions,
    ) -> Result<RequestHandle, FetchError> {
        let body = serde_json::to_string(body)?;
        let cache_key = options
            .cache_key
            .clone()
            .unwrap_or_else(|| derive_key(target_resource, &body).into());

        if let Some(hit) = self.inner.cache.get(&cache_key) {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(FetchError::Closed);
            }
            StatsCounters::bump(&self.inner.stats.cache_hits, 1);
            let (tx, rx) = oneshot::channel();
            let id = self.inner.coordinator.register(Box::new(move |result| {
                let _ = tx.send(result);
            }));
            self.inner.coordinator.deliver(id, Ok(hit));
            return Ok(RequestHandle::new(id, rx, Arc::clone(&self.inner)));
        }

        self.request_serialized(class, target_resource, body, options)
    }

    /// Flushes every strategy queue now.
    pub fn flush(&self) {
        self.inner.flush_all();
    }

    /// Flushes the queue of the strategy `class` resolves to.
    pub fn flush_class(&self, class: &str) {
        if let Some(strategy) = self.inner.config.strategies.resolve(class) {
            self.inner.flush_lane(&strategy.name, None);
        }
    }

    /// Cancels a request by subscriber id.
    pub fn cancel(&self, id: SubscriberId) -> CancelOutcome {
        self.inner.cancel(id)
    }

    /// The result cache this scheduler writes into.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    /// Drops every cached result, e.g. after a mutation invalidated them.
    pub fn flush_cache(&self) {
        self.inner.cache.flush();
    }

    /// Requests queued but not yet flushed, across all strategies.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .lanes
            .lock()
            .values()
            .map(|lane| lane.queue.len())
            .sum()
    }

    /// Subscribers still awaiting a delivery, queued or in flight.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.inner.coordinator.pending_count()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats.snapshot()
    }

    /// Shuts the scheduler down.
    ///
    /// New requests fail with [`FetchError::Closed`], queued requests are
    /// delivered `Closed`, and in-flight groups are aborted.
    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
