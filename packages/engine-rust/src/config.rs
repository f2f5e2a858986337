//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use metafetch_core::{StrategyError, StrategySet};

/// Errors from validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error("eager_flush_threshold must be greater than zero")]
    ZeroEagerThreshold,
    #[error("request_timeout_ms must be greater than zero")]
    ZeroRequestTimeout,
}

/// Top-level configuration for the batching engine.
///
/// Controls flush timing, retry pacing, the transport timeout and the named
/// strategies request classes resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Delay between the first enqueue of a cycle and the automatic flush,
    /// in milliseconds. 0 means one cooperative yield, which lets callers
    /// enqueuing in the same burst share a flush.
    pub flush_delay_ms: u64,
    /// Flush a strategy queue immediately once it holds this many pending
    /// requests. `None` disables the size trigger.
    pub eager_flush_threshold: Option<usize>,
    /// Pause between a failed attempt and the retry, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Per wire call timeout applied by the CLI's transport, in milliseconds.
    pub request_timeout_ms: u64,
    /// Named strategies and request-class routing.
    pub strategies: StrategySet,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: 0,
            eager_flush_threshold: None,
            retry_backoff_ms: 0,
            request_timeout_ms: 30_000,
            strategies: StrategySet::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON for this shape or
    /// fails validation.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let mut config: Self =
            serde_json::from_str(json).context("invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// Checks numeric invariants and strategy references.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.strategies.validate()?;
        if self.eager_flush_threshold == Some(0) {
            return Err(ConfigError::ZeroEagerThreshold);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use metafetch_core::DEFAULT_STRATEGY;

    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_delay(), Duration::ZERO);
        assert!(config.eager_flush_threshold.is_none());
        assert_eq!(config.retry_backoff(), Duration::ZERO);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        let default = config.strategies.resolve("anything").unwrap();
        assert_eq!(default.name, DEFAULT_STRATEGY);
    }

    #[test]
    fn parses_partial_documents() {
        let config = EngineConfig::from_json_str(
            r#"{
                "flushDelayMs": 5,
                "strategies": {
                    "strategies": {
                        "default": { "batchSize": 2, "retryOnError": 1, "parallelRequests": 1 }
                    },
                    "classes": { "dashboard": "default" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.flush_delay(), Duration::from_millis(5));
        assert_eq!(config.request_timeout_ms, 30_000);
        let strategy = config.strategies.resolve("dashboard").unwrap();
        assert_eq!(strategy.batch_size, 2);
        assert_eq!(strategy.name, "default");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(EngineConfig::from_json_str(r#"{ "eagerFlushThreshold": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{ "requestTimeoutMs": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str(
            r#"{ "strategies": { "classes": { "dashboard": "missing" } } }"#
        )
        .is_err());
        assert!(EngineConfig::from_json_str("[]").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/metafetch.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/metafetch.json"));
    }
}
