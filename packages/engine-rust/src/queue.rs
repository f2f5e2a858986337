//! Per-strategy pending queues.
//!
//! Requests wait here, grouped by target resource, until a flush drains
//! them. Groups keep the order in which their resource
//! first became ready; members keep submission order.

use std::time::Instant;

use metafetch_core::{RequestDescriptor, SubscriberId};

/// Requests for one target resource awaiting a flush.
#[derive(Debug)]
pub struct PendingGroup {
    pub target_resource: String,
    pub members: Vec<RequestDescriptor>,
    pub created_at: Instant,
}

/// Pending groups for one strategy.
#[derive(Debug, Default)]
pub struct PendingQueue {
    groups: Vec<PendingGroup>,
    len: usize,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request to the group for its target resource, creating the
    /// group on first use. Returns the number of pending requests.
    pub fn enqueue(&mut self, descriptor: RequestDescriptor) -> usize {
        match self
            .groups
            .iter_mut()
            .find(|g| g.target_resource == descriptor.target_resource)
        {
            Some(group) => group.members.push(descriptor),
            None => self.groups.push(PendingGroup {
                target_resource: descriptor.target_resource.clone(),
                members: vec![descriptor],
                created_at: Instant::now(),
            }),
        }
        self.len += 1;
        self.len
    }

    /// Removes a not-yet-flushed request. Groups left empty are dropped.
    pub fn remove(&mut self, subscriber: SubscriberId) -> Option<RequestDescriptor> {
        let (gi, pos) = self.groups.iter().enumerate().find_map(|(gi, group)| {
            group
                .members
                .iter()
                .position(|d| d.subscriber == subscriber)
                .map(|pos| (gi, pos))
        })?;
        let removed = self.groups[gi].members.remove(pos);
        if self.groups[gi].members.is_empty() {
            self.groups.remove(gi);
        }
        self.len -= 1;
        Some(removed)
    }

    /// Number of pending requests across all resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct resources with pending requests.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Age of the oldest pending group.
    #[must_use]
    pub fn oldest(&self) -> Option<Instant> {
        self.groups.iter().map(|g| g.created_at).min()
    }

    /// Empties the queue, resource by resource in readiness order and in
    /// submission order within a resource.
    ///
    /// Batching happens after deduplication, so the flush cuts the merged
    /// requests, not these descriptors, into wire calls.
    pub fn drain(&mut self) -> Vec<RequestDescriptor> {
        self.len = 0;
        self.groups.drain(..).flat_map(|g| g.members).collect()
    }
}
