// =============================================================================
// Razor — EMA9/EMA21 crossover strategy
// =============================================================================
//
// Built on `indicators::ema::ema_trend_aligned`, narrowed to a plain
// two-line crossover: go long once EMA9 crosses above EMA21, short on the
// reverse cross. No regime/VPIN/orderbook layer — this is one of the two
// opaque signal generators the engine ships (see [`super::thor`] for the
// other).
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManagerError;
use crate::indicators::ema::calculate_ema;
use crate::strategy::{Signal, Strategy};
use crate::types::Side;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RazorParams {
    #[serde(default = "default_fast")]
    pub fast_period: usize,
    #[serde(default = "default_slow")]
    pub slow_period: usize,
    #[serde(default = "default_sl_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_tp_pct")]
    pub take_profit_pct: f64,
    /// Target notional per entry, in quote currency.
    #[serde(default = "default_trade_size")]
    pub trade_size: f64,
}

fn default_fast() -> usize {
    9
}
fn default_slow() -> usize {
    21
}
fn default_sl_pct() -> f64 {
    0.004
}
fn default_tp_pct() -> f64 {
    0.006
}
fn default_trade_size() -> f64 {
    100.0
}

impl Default for RazorParams {
    fn default() -> Self {
        Self {
            fast_period: default_fast(),
            slow_period: default_slow(),
            stop_loss_pct: default_sl_pct(),
            take_profit_pct: default_tp_pct(),
            trade_size: default_trade_size(),
        }
    }
}

impl RazorParams {
    pub fn from_value(value: &Value) -> Result<Self, ManagerError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ManagerError::Validation(format!("invalid razor params: {e}")))
    }
}

pub struct RazorStrategy {
    params: RazorParams,
}

impl RazorStrategy {
    pub fn new(params: RazorParams) -> Self {
        Self { params }
    }
}

impl Strategy for RazorStrategy {
    fn kind(&self) -> &'static str {
        "razor"
    }

    fn min_history(&self) -> usize {
        self.params.slow_period + 2
    }

    fn trade_size(&self) -> f64 {
        self.params.trade_size
    }

    fn evaluate(&self, prices: &[f64]) -> Option<Signal> {
        if prices.len() < self.min_history() {
            return None;
        }

        let fast_now = calculate_ema(prices, self.params.fast_period);
        let slow_now = calculate_ema(prices, self.params.slow_period);
        if fast_now.len() < 2 || slow_now.len() < 2 {
            return None;
        }

        let fast_prev = fast_now[fast_now.len() - 2];
        let fast_last = *fast_now.last()?;
        let slow_prev = slow_now[slow_now.len() - 2];
        let slow_last = *slow_now.last()?;

        let crossed_up = fast_prev <= slow_prev && fast_last > slow_last;
        let crossed_down = fast_prev >= slow_prev && fast_last < slow_last;

        let side = if crossed_up {
            Side::Buy
        } else if crossed_down {
            Side::Sell
        } else {
            return None;
        };

        Some(Signal {
            side,
            stop_loss_pct: self.params.stop_loss_pct,
            take_profit_pct: self.params.take_profit_pct,
            reason: format!(
                "ema{} crossed {} ema{}",
                self.params.fast_period,
                if crossed_up { "above" } else { "below" },
                self.params.slow_period
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> RazorStrategy {
        RazorStrategy::new(RazorParams::default())
    }

    #[test]
    fn no_signal_without_enough_history() {
        let s = strategy();
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!(s.evaluate(&prices).is_none());
    }

    #[test]
    fn detects_bullish_crossover() {
        let s = strategy();
        // Flat then a sharp upward kick forces the fast EMA above the slow one.
        let mut prices = vec![100.0; 40];
        for i in 0..10 {
            prices.push(100.0 + i as f64 * 2.0);
        }
        let signal = s.evaluate(&prices);
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().side, Side::Buy);
    }

    #[test]
    fn detects_bearish_crossover() {
        let s = strategy();
        let mut prices = vec![100.0; 40];
        for i in 0..10 {
            prices.push(100.0 - i as f64 * 2.0);
        }
        let signal = s.evaluate(&prices);
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().side, Side::Sell);
    }

    #[test]
    fn flat_series_produces_no_signal() {
        let s = strategy();
        let prices = vec![100.0; 60];
        assert!(s.evaluate(&prices).is_none());
    }

    #[test]
    fn invalid_params_rejected() {
        let bad = serde_json::json!({ "fast_period": "not a number" });
        assert!(RazorParams::from_value(&bad).is_err());
    }
}
