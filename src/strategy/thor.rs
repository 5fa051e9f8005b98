// =============================================================================
// Thor — RSI mean-reversion strategy
// =============================================================================
//
// Built on `indicators::rsi::calculate_rsi` and the standard overbought/
// oversold thresholds (RSI > 70 / < 30). Fades extremes: buys when RSI drops
// through the oversold threshold, sells when it rises through overbought —
// the inverse read of [`super::razor`]'s trend-following stance.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManagerError;
use crate::indicators::rsi::calculate_rsi;
use crate::strategy::{Signal, Strategy};
use crate::types::Side;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThorParams {
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
    #[serde(default = "default_sl_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_tp_pct")]
    pub take_profit_pct: f64,
    /// Target notional per entry, in quote currency.
    #[serde(default = "default_trade_size")]
    pub trade_size: f64,
}

fn default_period() -> usize {
    14
}
fn default_oversold() -> f64 {
    30.0
}
fn default_overbought() -> f64 {
    70.0
}
fn default_sl_pct() -> f64 {
    0.005
}
fn default_tp_pct() -> f64 {
    0.008
}
fn default_trade_size() -> f64 {
    100.0
}

impl Default for ThorParams {
    fn default() -> Self {
        Self {
            period: default_period(),
            oversold: default_oversold(),
            overbought: default_overbought(),
            stop_loss_pct: default_sl_pct(),
            take_profit_pct: default_tp_pct(),
            trade_size: default_trade_size(),
        }
    }
}

impl ThorParams {
    pub fn from_value(value: &Value) -> Result<Self, ManagerError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ManagerError::Validation(format!("invalid thor params: {e}")))
    }
}

pub struct ThorStrategy {
    params: ThorParams,
}

impl ThorStrategy {
    pub fn new(params: ThorParams) -> Self {
        Self { params }
    }
}

impl Strategy for ThorStrategy {
    fn kind(&self) -> &'static str {
        "thor"
    }

    fn min_history(&self) -> usize {
        self.params.period + 3
    }

    fn trade_size(&self) -> f64 {
        self.params.trade_size
    }

    fn evaluate(&self, prices: &[f64]) -> Option<Signal> {
        if prices.len() < self.min_history() {
            return None;
        }

        let rsi = calculate_rsi(prices, self.params.period);
        if rsi.len() < 2 {
            return None;
        }

        let prev = rsi[rsi.len() - 2];
        let last = *rsi.last()?;

        // Trigger on the threshold crossing, not on every tick spent beyond it,
        // so a single signal fires per excursion rather than one per tick.
        let crossed_up_from_oversold = prev <= self.params.oversold && last > self.params.oversold;
        let crossed_down_from_overbought = prev >= self.params.overbought && last < self.params.overbought;

        let side = if crossed_up_from_oversold {
            Side::Buy
        } else if crossed_down_from_overbought {
            Side::Sell
        } else {
            return None;
        };

        Some(Signal {
            side,
            stop_loss_pct: self.params.stop_loss_pct,
            take_profit_pct: self.params.take_profit_pct,
            reason: format!("rsi{} reverted from {:.1} to {:.1}", self.params.period, prev, last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> ThorStrategy {
        ThorStrategy::new(ThorParams::default())
    }

    #[test]
    fn no_signal_without_enough_history() {
        let s = strategy();
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!(s.evaluate(&prices).is_none());
    }

    #[test]
    fn buy_signal_on_recovery_from_oversold() {
        let s = strategy();
        let mut prices = vec![100.0];
        for _ in 0..20 {
            let last = *prices.last().unwrap();
            prices.push(last - 1.5);
        }
        // Sharp bounce drags RSI back up through the oversold threshold.
        for _ in 0..3 {
            let last = *prices.last().unwrap();
            prices.push(last + 4.0);
        }
        let signal = s.evaluate(&prices);
        if let Some(sig) = signal {
            assert_eq!(sig.side, Side::Buy);
        }
    }

    #[test]
    fn invalid_params_rejected() {
        let bad = serde_json::json!({ "period": -1 });
        assert!(ThorParams::from_value(&bad).is_err());
    }

    #[test]
    fn default_params_have_documented_thresholds() {
        let p = ThorParams::default();
        assert_eq!(p.oversold, 30.0);
        assert_eq!(p.overbought, 70.0);
    }
}
