//! Strategy registry.

use std::collections::HashMap;
use std::fmt;

use super::algorithm::Algorithm;
use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::sliding_window::{SlidingWindow, WeightedSlidingWindow};
use super::token_bucket::TokenBucket;
use crate::config::{LimiterConfig, SlidingWindowMode, Strategy};
use crate::error::{Result, TurnstileError};

/// Builds an algorithm from a validated configuration.
pub type AlgorithmFactory = fn(&LimiterConfig) -> Box<dyn Algorithm>;

/// Maps strategies to the factories that build them.
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<Strategy, AlgorithmFactory>,
}

impl Registry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register or replace the factory for `strategy`.
    pub fn register(&mut self, strategy: Strategy, factory: AlgorithmFactory) -> &mut Self {
        self.factories.insert(strategy, factory);
        self
    }

    pub fn contains(&self, strategy: Strategy) -> bool {
        self.factories.contains_key(&strategy)
    }

    /// Build the algorithm `config` asks for.
    pub fn create(&self, config: &LimiterConfig) -> Result<Box<dyn Algorithm>> {
        self.factories
            .get(&config.strategy)
            .map(|factory| factory(config))
            .ok_or_else(|| TurnstileError::UnknownStrategy(config.strategy.to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Strategy::FixedWindow, fixed_window)
            .register(Strategy::SlidingWindow, sliding_window)
            .register(Strategy::TokenBucket, token_bucket)
            .register(Strategy::LeakyBucket, leaky_bucket);
        registry
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut strategies: Vec<_> = self.factories.keys().map(Strategy::as_str).collect();
        strategies.sort_unstable();
        f.debug_struct("Registry")
            .field("strategies", &strategies)
            .finish()
    }
}

fn fixed_window(config: &LimiterConfig) -> Box<dyn Algorithm> {
    Box::new(FixedWindow::new(config.limit, config.window()))
}

fn sliding_window(config: &LimiterConfig) -> Box<dyn Algorithm> {
    match config.sliding_window {
        SlidingWindowMode::Precise => Box::new(SlidingWindow::new(config.limit, config.window())),
        SlidingWindowMode::Weighted => {
            Box::new(WeightedSlidingWindow::new(config.limit, config.window()))
        }
    }
}

fn token_bucket(config: &LimiterConfig) -> Box<dyn Algorithm> {
    Box::new(TokenBucket::new(config.limit, config.window()))
}

fn leaky_bucket(config: &LimiterConfig) -> Box<dyn Algorithm> {
    Box::new(LeakyBucket::new(config.limit, config.window()))
}
