//! Request key derivation.
//!
//! A [`RequestKey`] identifies one logical fetch. It is used both to collapse
//! identical requests within a dispatch cycle and to look results up in the
//! result cache, so two keys compare equal exactly when their
//! `(target_resource, body)` pairs are byte-identical.
//!
//! The key is a BLAKE3 digest over a length-prefixed framing of both parts.
//! Length prefixes keep `("ab", "c")` and `("a", "bc")` apart.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, deterministic identifier for a `(target_resource, body)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Returns the hex-encoded digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> Self {
        key.0
    }
}

/// Derives the uniqueness key for a request.
///
/// Pure function: no I/O, no hidden state.
///
/// # Examples
///
/// ```
/// use metafetch_core::hash::derive_key;
///
/// let a = derive_key("index_a", r#"{"size":0}"#);
/// let b = derive_key("index_a", r#"{"size":0}"#);
/// assert_eq!(a, b);
/// assert_ne!(a, derive_key("index_b", r#"{"size":0}"#));
/// ```
#[must_use]
pub fn derive_key(target_resource: &str, body: &str) -> RequestKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(target_resource.len() as u64).to_le_bytes());
    hasher.update(target_resource.as_bytes());
    hasher.update(&(body.len() as u64).to_le_bytes());
    hasher.update(body.as_bytes());
    RequestKey(hex::encode(hasher.finalize().as_bytes()))
}
