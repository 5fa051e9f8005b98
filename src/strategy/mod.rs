// =============================================================================
// Strategy Registry
// =============================================================================
//
// Strategies are opaque signal generators: the executor feeds each one a
// rolling price history and gets back an optional directional signal with
// its own stop-loss/take-profit sizing, following a read-market-state-in,
// decision-out shape. Stripped down to a narrow single-indicator signal per
// strategy rather than a weighted multi-signal score — what exactly a
// strategy computes is deliberately implementation-defined per kind.
// =============================================================================

pub mod razor;
pub mod thor;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ManagerError;
use crate::types::Side;

/// A directional trade proposal produced by a strategy's evaluation of the
/// current price history.
#[derive(Debug, Clone)]
pub struct Signal {
    pub side: Side,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reason: String,
}

/// The contract every strategy kind implements. Stateless across calls —
/// all state the strategy needs lives in the price history it's handed, so
/// a strategy instance can be rebuilt identically from its persisted params
/// on auto-resume.
pub trait Strategy: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Minimum number of price samples required before `evaluate` can
    /// produce a signal; the executor withholds evaluation until its
    /// history reaches this length.
    fn min_history(&self) -> usize;

    /// `prices` is oldest-first. Returns `None` when there is no actionable
    /// signal at the current tick.
    fn evaluate(&self, prices: &[f64]) -> Option<Signal>;

    /// Target notional (in quote currency) for a new entry. The executor
    /// divides this by the current price and rounds to the instrument's lot
    /// size to get the actual order amount — this is the per-instance
    /// `tradeSize` the strategy was configured with, not a balance-derived
    /// sizing policy.
    fn trade_size(&self) -> f64;
}

type StrategyFactory = dyn Fn(&Value) -> Result<Arc<dyn Strategy>, ManagerError> + Send + Sync;

/// Maps a strategy kind name (as persisted on [`crate::repository::StrategyRecord`])
/// to a constructor that validates and builds a concrete [`Strategy`].
pub struct StrategyRegistry {
    factories: HashMap<&'static str, Box<StrategyFactory>>,
}

impl StrategyRegistry {
    /// Registry pre-loaded with the two strategy kinds this engine ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("razor", |params| {
            razor::RazorParams::from_value(params).map(|p| Arc::new(razor::RazorStrategy::new(p)) as Arc<dyn Strategy>)
        });
        registry.register("thor", |params| {
            thor::ThorParams::from_value(params).map(|p| Arc::new(thor::ThorStrategy::new(p)) as Arc<dyn Strategy>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &'static str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Strategy>, ManagerError> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn build(&self, kind: &str, params: &Value) -> Result<Arc<dyn Strategy>, ManagerError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ManagerError::UnknownStrategy(kind.to_string()))?;
        factory(params)
    }

    pub fn known_kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
