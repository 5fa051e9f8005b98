// =============================================================================
// Broker Port
// =============================================================================
//
// A polymorphic capability implemented per broker. Nothing above this trait
// may depend on a broker-specific wire type; `deribit.rs` and `mock.rs` are
// the only two modules allowed to know what a Deribit JSON-RPC frame looks
// like.
// =============================================================================

pub mod deribit;
pub mod mock;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::Side;

/// Order type accepted by [`BrokerClient::place_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

/// One child leg of an OTOCO attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtocoChild {
    pub order_type: OrderType,
    pub side: Side,
    pub amount: f64,
    /// Limit price (take-profit leg).
    pub price: Option<f64>,
    /// Trigger price (stop-market leg, triggered off mark price).
    pub trigger_price: Option<f64>,
    pub label: String,
}

/// An order placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub label: String,
    /// If set and the broker supports it, the entry is submitted with a
    /// native one-triggers-one-cancels-other child list.
    pub otoco_children: Vec<OtocoChild>,
}

impl OrderRequest {
    pub fn new(instrument: impl Into<String>, side: Side, order_type: OrderType, amount: f64) -> Self {
        Self {
            instrument: instrument.into(),
            side,
            order_type,
            amount,
            price: None,
            trigger_price: None,
            reduce_only: false,
            label: String::new(),
            otoco_children: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Result of a successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub label: String,
    /// `Some(price)` if the broker reports an immediate fill (market orders,
    /// or a limit order that crossed the book).
    pub filled_price: Option<f64>,
    pub filled: bool,
}

/// Snapshot of a resting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: String,
    pub instrument: String,
    pub label: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
}

/// Snapshot of a broker-reported position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    /// Signed size; magnitude is what matters to the core, sign indicates
    /// side held.
    pub size: f64,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size.abs() < f64::EPSILON
    }
}

/// Instrument metadata needed to round prices/amounts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub tick_size: f64,
    pub min_trade_amount: f64,
    pub contract_size: f64,
}

/// A single ticker update delivered to a subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub instrument_time_ms: i64,
    pub price: f64,
}

/// The abstract contract every broker integration implements. All operations
/// are asynchronous and bounded by caller-enforced timeouts (via
/// `tokio::time::timeout`, not the trait itself, so a slow implementation
/// cannot silently violate the budget).
#[async_trait]
pub trait BrokerClient: Send + Sync + fmt::Debug {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, BrokerError>;

    /// `NotFound` is not an error for the caller — it is the success case of
    /// "already gone".
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn cancel_all_for_instrument(&self, instrument: &str) -> Result<(), BrokerError>;

    async fn list_open_orders(&self, instrument: &str) -> Result<Vec<OrderSummary>, BrokerError>;

    async fn list_positions(&self, currency: &str) -> Result<Vec<Position>, BrokerError>;

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, BrokerError>;

    /// Subscribe to ticker updates for `instrument`. Implementations deliver
    /// updates on `handler` from whatever internal task drives the socket;
    /// callers rely on their own serialised per-executor delivery discipline
    /// rather than on ordering guarantees from this trait.
    async fn subscribe_ticker(
        &self,
        instrument: &str,
        handler: tokio::sync::mpsc::Sender<TickerUpdate>,
    ) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}
