// =============================================================================
// Price History — the rolling window each executor feeds its strategy
// =============================================================================
//
// A fixed-capacity ring buffer of ticker prices: bounded `VecDeque`, oldest
// trimmed on overflow, carrying raw prices rather than OHLCV bars since the
// engine's strategies read a plain price series.
// =============================================================================

use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct PriceHistory {
    prices: VecDeque<f64>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// Oldest-first snapshot, suitable for feeding a [`crate::strategy::Strategy`].
    pub fn as_slice(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_oldest_on_overflow() {
        let mut hist = PriceHistory::with_capacity(3);
        hist.push(1.0);
        hist.push(2.0);
        hist.push(3.0);
        hist.push(4.0);
        assert_eq!(hist.as_slice(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn last_reflects_most_recent_push() {
        let mut hist = PriceHistory::new();
        hist.push(10.0);
        hist.push(20.0);
        assert_eq!(hist.last(), Some(20.0));
    }

    #[test]
    fn empty_history_has_no_last() {
        let hist = PriceHistory::new();
        assert!(hist.is_empty());
        assert_eq!(hist.last(), None);
    }
}
