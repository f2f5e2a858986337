//! Request descriptors: the value object for one caller's logical fetch.

use std::fmt;

use serde::Serialize;

use crate::error::FetchError;
use crate::hash::{derive_key, RequestKey};

/// Identifies one caller awaiting a result.
///
/// Ids are allocated by the engine and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One caller's request, created per invocation and consumed by one flush.
///
/// `key` is always derived from `(target_resource, body)`, so two descriptors
/// with equal keys are semantically identical. `cache_key` is where the result
/// is stored in the result cache; it defaults to the request key but callers
/// may alias it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub key: RequestKey,
    pub target_resource: String,
    pub body: String,
    pub subscriber: SubscriberId,
    pub cache_key: String,
}

impl RequestDescriptor {
    /// Creates a descriptor from an already-serialized body.
    pub fn new(
        target_resource: impl Into<String>,
        body: impl Into<String>,
        subscriber: SubscriberId,
    ) -> Self {
        let target_resource = target_resource.into();
        let body = body.into();
        let key = derive_key(&target_resource, &body);
        let cache_key = key.to_string();
        Self {
            key,
            target_resource,
            body,
            subscriber,
            cache_key,
        }
    }

    /// Serializes `body` to compact JSON and builds a descriptor from it.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Serialization`] if `body` cannot be represented
    /// as JSON (for example a map with non-string keys).
    pub fn from_body<T: Serialize + ?Sized>(
        target_resource: impl Into<String>,
        body: &T,
        subscriber: SubscriberId,
    ) -> Result<Self, FetchError> {
        let body = serde_json::to_string(body)?;
        Ok(Self::new(target_resource, body, subscriber))
    }

    /// Overrides the cache key the result is written under.
    #[must_use]
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = cache_key.into();
        self
    }
}
