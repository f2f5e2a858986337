//! Named batching strategies and request-class resolution.
//!
//! A [`Strategy`] controls how many bodies share one wire call, how often a
//! failed call is retried and how many calls may be in flight at once.
//! Request classes ("dashboard counts", "relational-filter counts", ...) pick a
//! strategy by name through a [`StrategySet`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the strategy every unmapped request class falls back to.
pub const DEFAULT_STRATEGY: &str = "default";

/// Errors from building or validating strategies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    #[error("strategy '{name}': batch_size must be greater than zero")]
    ZeroBatchSize { name: String },
    #[error("strategy '{name}': parallel_requests must be at least one")]
    ZeroParallelism { name: String },
    #[error("request class '{class}' maps to undefined strategy '{strategy}'")]
    UndefinedStrategy { class: String, strategy: String },
}

/// Immutable batching configuration for one class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Strategy name. Overwritten with the map key when loaded from configuration.
    #[serde(default)]
    pub name: String,
    /// Maximum number of bodies carried by one wire call.
    pub batch_size: usize,
    /// Additional attempts after a failed wire call.
    #[serde(default)]
    pub retry_on_error: u32,
    /// Maximum number of wire calls in flight for this strategy.
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,
}

fn default_parallel_requests() -> usize {
    1
}

impl Strategy {
    /// Creates and validates a strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero or `parallel_requests` is zero.
    pub fn new(
        name: impl Into<String>,
        batch_size: usize,
        retry_on_error: u32,
        parallel_requests: usize,
    ) -> Result<Self, StrategyError> {
        let strategy = Self {
            name: name.into(),
            batch_size,
            retry_on_error,
            parallel_requests,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    /// Checks the numeric invariants.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero or `parallel_requests` is zero.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.batch_size == 0 {
            return Err(StrategyError::ZeroBatchSize {
                name: self.name.clone(),
            });
        }
        if self.parallel_requests == 0 {
            return Err(StrategyError::ZeroParallelism {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Total number of wire attempts allowed for one group.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_on_error.saturating_add(1)
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            name: DEFAULT_STRATEGY.to_string(),
            batch_size: 20,
            retry_on_error: 1,
            parallel_requests: 2,
        }
    }
}

/// Named strategies plus the mapping from request class to strategy name.
///
/// A document that omits `strategies` keeps the built-in `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategySet {
    strategies: HashMap<String, Strategy>,
    classes: HashMap<String, String>,
}

impl Default for StrategySet {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(DEFAULT_STRATEGY.to_string(), Strategy::default());
        Self {
            strategies,
            classes: HashMap::new(),
        }
    }
}

impl StrategySet {
    /// Creates a set containing only the built-in `"default"` strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a strategy under its own name.
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy fails validation.
    pub fn insert(&mut self, strategy: Strategy) -> Result<(), StrategyError> {
        strategy.validate()?;
        self.strategies.insert(strategy.name.clone(), strategy);
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy fails validation.
    pub fn with_strategy(mut self, strategy: Strategy) -> Result<Self, StrategyError> {
        self.insert(strategy)?;
        Ok(self)
    }

    /// Routes a request class to a named strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if no strategy with that name exists.
    pub fn map_class(
        &mut self,
        class: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Result<(), StrategyError> {
        let class = class.into();
        let strategy = strategy.into();
        if !self.strategies.contains_key(&strategy) {
            return Err(StrategyError::UndefinedStrategy { class, strategy });
        }
        self.classes.insert(class, strategy);
        Ok(())
    }

    /// Looks up a strategy by its own name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Strategy> {
        self.strategies.get(name)
    }

    /// Resolves the strategy governing a request class.
    ///
    /// Resolution order: explicit class mapping, a strategy named after the
    /// class, then [`DEFAULT_STRATEGY`].
    #[must_use]
    pub fn resolve(&self, class: &str) -> Option<&Strategy> {
        self.classes
            .get(class)
            .and_then(|name| self.strategies.get(name))
            .or_else(|| self.strategies.get(class))
            .or_else(|| self.strategies.get(DEFAULT_STRATEGY))
    }

    /// Iterates all strategies in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.values()
    }

    /// Normalizes names taken from map keys and validates every entry.
    ///
    /// Called after deserialization, where `name` may be omitted in favor of
    /// the map key.
    ///
    /// # Errors
    ///
    /// Returns the first invalid strategy or dangling class mapping.
    pub fn validate(&mut self) -> Result<(), StrategyError> {
        for (name, strategy) in &mut self.strategies {
            strategy.name.clone_from(name);
            strategy.validate()?;
        }
        for (class, strategy) in &self.classes {
            if !self.strategies.contains_key(strategy) {
                return Err(StrategyError::UndefinedStrategy {
                    class: class.clone(),
                    strategy: strategy.clone(),
                });
            }
        }
        Ok(())
    }
}
