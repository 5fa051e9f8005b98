// =============================================================================
// Mock Broker — deterministic fake used by the scenario tests
// =============================================================================
//
// A local-fill simulation: market orders fill immediately at the
// requested/last price, limit and stop-market orders rest until the test
// explicitly fills or cancels them. Everything is driven through plain
// setter methods so a test can script an exact sequence of ticks, fills,
// and rejections without any network I/O.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::Sender;

use crate::broker::{
    BrokerClient, InstrumentInfo, OrderRequest, OrderResult, OrderSummary, OrderType, Position,
    TickerUpdate,
};
use crate::error::BrokerError;

struct MockState {
    instruments: HashMap<String, InstrumentInfo>,
    open_orders: HashMap<String, OrderSummary>,
    positions: HashMap<String, f64>,
    last_price: HashMap<String, f64>,
    ticker_subs: HashMap<String, Vec<Sender<TickerUpdate>>>,
    /// Label suffixes (e.g. "_tp") that should be rejected on the next
    /// `place_order` call carrying that suffix. Consumed on use? No — sticky
    /// until cleared, so a test can assert the rollback happens exactly once.
    reject_suffixes: Vec<String>,
    connected: bool,
}

/// A deterministic, fully in-memory broker used only by tests.
pub struct MockBroker {
    state: RwLock<MockState>,
    next_order_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState {
                instruments: HashMap::new(),
                open_orders: HashMap::new(),
                positions: HashMap::new(),
                last_price: HashMap::new(),
                ticker_subs: HashMap::new(),
                reject_suffixes: Vec::new(),
                connected: true,
            }),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn set_instrument(&self, instrument: &str, info: InstrumentInfo) {
        self.state
            .write()
            .instruments
            .insert(instrument.to_string(), info);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.write().connected = connected;
    }

    /// Force any future `place_order` whose label ends with `suffix` to fail
    /// with `RejectedInvalid` — used to script S2 (rollback on TP failure).
    pub fn reject_label_suffix(&self, suffix: impl Into<String>) {
        self.state.write().reject_suffixes.push(suffix.into());
    }

    /// Directly set the broker-reported position size for an instrument
    /// (used to simulate a fill closing to zero, or a pre-existing orphan
    /// position for reconciliation tests).
    pub fn set_position(&self, instrument: &str, size: f64) {
        self.state
            .write()
            .positions
            .insert(instrument.to_string(), size);
    }

    /// Push a ticker update to every subscriber of `instrument` and record it
    /// as the "last known price" used for market fills.
    pub async fn push_price(&self, instrument: &str, price: f64) {
        let senders = {
            let mut s = self.state.write();
            s.last_price.insert(instrument.to_string(), price);
            s.ticker_subs.get(instrument).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx
                .send(TickerUpdate {
                    instrument_time_ms: 0,
                    price,
                })
                .await;
        }
    }

    pub fn open_order_count(&self, instrument: &str) -> usize {
        self.state
            .read()
            .open_orders
            .values()
            .filter(|o| o.instrument == instrument)
            .count()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker").finish()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, BrokerError> {
        let mut s = self.state.write();
        if !s.connected {
            return Err(BrokerError::Disconnected);
        }

        if s.reject_suffixes.iter().any(|suf| req.label.ends_with(suf.as_str())) {
            return Err(BrokerError::RejectedInvalid(format!(
                "mock broker scripted rejection for label {}",
                req.label
            )));
        }

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("mock-{id}");

        match req.order_type {
            OrderType::Market => {
                let fill_price = req
                    .price
                    .or_else(|| s.last_price.get(&req.instrument).copied())
                    .unwrap_or(0.0);
                let delta = req.side.direction() * req.amount;
                *s.positions.entry(req.instrument.clone()).or_insert(0.0) += delta;
                Ok(OrderResult {
                    order_id,
                    label: req.label,
                    filled_price: Some(fill_price),
                    filled: true,
                })
            }
            OrderType::Limit | OrderType::StopMarket => {
                s.open_orders.insert(
                    order_id.clone(),
                    OrderSummary {
                        order_id: order_id.clone(),
                        instrument: req.instrument.clone(),
                        label: req.label.clone(),
                        side: req.side,
                        order_type: req.order_type,
                        amount: req.amount,
                        price: req.price,
                        trigger_price: req.trigger_price,
                        reduce_only: req.reduce_only,
                    },
                );
                Ok(OrderResult {
                    order_id,
                    label: req.label,
                    filled_price: None,
                    filled: false,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.state.write().open_orders.remove(order_id);
        Ok(())
    }

    async fn cancel_all_for_instrument(&self, instrument: &str) -> Result<(), BrokerError> {
        self.state
            .write()
            .open_orders
            .retain(|_, o| o.instrument != instrument);
        Ok(())
    }

    async fn list_open_orders(&self, instrument: &str) -> Result<Vec<OrderSummary>, BrokerError> {
        Ok(self
            .state
            .read()
            .open_orders
            .values()
            .filter(|o| o.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn list_positions(&self, _currency: &str) -> Result<Vec<Position>, BrokerError> {
        Ok(self
            .state
            .read()
            .positions
            .iter()
            .map(|(instrument, size)| Position {
                instrument: instrument.clone(),
                size: *size,
            })
            .collect())
    }

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, BrokerError> {
        Ok(self
            .state
            .read()
            .instruments
            .get(instrument)
            .copied()
            .unwrap_or(InstrumentInfo {
                tick_size: 0.5,
                min_trade_amount: 0.001,
                contract_size: 1.0,
            }))
    }

    async fn subscribe_ticker(
        &self,
        instrument: &str,
        handler: Sender<TickerUpdate>,
    ) -> Result<(), BrokerError> {
        self.state
            .write()
            .ticker_subs
            .entry(instrument.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }
}

pub fn shared() -> Arc<MockBroker> {
    Arc::new(MockBroker::new())
}
