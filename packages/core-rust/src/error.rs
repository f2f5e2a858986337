//! Error taxonomy shared by every stage of the fetch pipeline.
//!
//! `FetchError` is what a caller eventually receives. It is `Clone` because a
//! single batch outcome is fanned out to every subscriber of a merged request.

use std::sync::Arc;

use serde_json::Value;

/// Outcome delivered to a single subscriber.
pub type FetchResult = Result<Arc<Value>, FetchError>;

/// Errors surfaced to callers of the batching engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request body could not be serialized. Reported synchronously to
    /// the single caller; the request never enters a batch.
    #[error("request body could not be serialized: {message}")]
    Serialization { message: String },

    /// The multi-request wire call failed on every attempt.
    #[error("transport failed after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// The backend answered with a different number of responses than bodies
    /// were submitted. Never retried.
    #[error("backend returned {actual} response(s) for {expected} request(s)")]
    ProtocolMismatch { expected: usize, actual: usize },

    /// The backend answered this particular item with an error.
    #[error("backend rejected request: {message}")]
    Backend { message: String },

    /// The scheduler was shut down before the request could be delivered.
    #[error("scheduler is closed")]
    Closed,

    /// No strategy could be resolved for the request class.
    #[error("no batching strategy for request class '{class}'")]
    UnknownStrategy { class: String },
}

impl FetchError {
    /// Builds a `Serialization` error from anything displayable.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_counts() {
        let err = FetchError::ProtocolMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "backend returned 2 response(s) for 3 request(s)"
        );
    }

    #[test]
    fn serde_errors_become_serialization_errors() {
        let err = serde_json::from_str::<Value>("{not json").unwrap_err();
        assert!(matches!(
            FetchError::from(err),
            FetchError::Serialization { .. }
        ));
    }
}
