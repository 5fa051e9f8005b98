// =============================================================================
// Bracket Orchestrator
// =============================================================================
//
// Places an entry order followed by its two protective legs (stop-loss,
// take-profit) as three sequential broker calls rather than relying on a
// broker's native one-triggers-one-cancels-other grouping, because the
// rollback behaviour this component is responsible for — tearing down
// whatever already landed if a later leg is rejected — only matters when the
// legs are placed (and can fail) independently. Follows a
// place-then-open-position sequencing, extended with explicit compensating
// actions a demo-only fill simulator never needed.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::broker::{BrokerClient, InstrumentInfo, OrderRequest, OrderResult, OrderType};
use crate::error::BracketError;
use crate::types::Side;

/// Parameters for a single bracket placement.
#[derive(Debug, Clone)]
pub struct BracketRequest {
    pub instrument: String,
    pub side: Side,
    pub amount: f64,
    /// Entry leg order type — `Market` fills immediately at the reference
    /// price, `Limit` rests at `entry_price` until it crosses the book.
    pub entry_type: OrderType,
    /// Required when `entry_type` is `Limit`; ignored for `Market`.
    pub entry_price: Option<f64>,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    /// The price the signal was evaluated against — used only to reject a
    /// degenerate bracket whose rounded SL or TP collapses onto it.
    pub reference_price: f64,
    pub label_prefix: String,
}

#[derive(Debug, Clone)]
pub struct BracketResult {
    pub entry: OrderResult,
    pub stop_loss: OrderResult,
    pub take_profit: OrderResult,
    pub entry_fill_price: f64,
    /// The lot-rounded amount actually submitted on every leg.
    pub amount: f64,
}

/// Rounds a price to the instrument's tick size — half up, matching
/// standard exchange rounding for limit/trigger prices.
pub fn round_to_tick(price: f64, info: &InstrumentInfo) -> f64 {
    if info.tick_size <= 0.0 {
        return price;
    }
    (price / info.tick_size).round() * info.tick_size
}

pub fn round_to_lot(amount: f64, info: &InstrumentInfo) -> f64 {
    if info.min_trade_amount <= 0.0 {
        return amount;
    }
    let lots = (amount / info.min_trade_amount).round();
    (lots * info.min_trade_amount).max(info.min_trade_amount)
}

pub struct BracketOrchestrator;

impl BracketOrchestrator {
    /// Places the entry then the two protective legs. On failure of any
    /// protective leg, cancels whatever protective leg already landed and
    /// flattens the entry back to zero before returning
    /// [`BracketError::RolledBack`] — the position and the book must both be
    /// clean on exit from this function, success or failure.
    ///
    /// Each leg is bounded by `leg_timeout`; a leg that doesn't resolve in
    /// time is treated the same as a rejection and triggers the same
    /// rollback path.
    #[instrument(skip(broker, req), fields(instrument = %req.instrument))]
    pub async fn place_bracket(
        broker: &Arc<dyn BrokerClient>,
        req: BracketRequest,
        leg_timeout: Duration,
    ) -> Result<BracketResult, BracketError> {
        let info = broker
            .get_instrument(&req.instrument)
            .await
            .map_err(|e| BracketError::Unknown(format!("instrument lookup failed: {e}")))?;

        let amount = round_to_lot(req.amount, &info);
        let stop_loss_price = round_to_tick(req.stop_loss_price, &info);
        let take_profit_price = round_to_tick(req.take_profit_price, &info);
        let reference_price = round_to_tick(req.reference_price, &info);
        if stop_loss_price == reference_price || take_profit_price == reference_price {
            return Err(BracketError::Rejected(format!(
                "rounded stop-loss/take-profit collapses onto the reference price {reference_price}"
            )));
        }
        let exit_side = req.side.opposite();

        let mut entry_req = OrderRequest::new(req.instrument.clone(), req.side, req.entry_type, amount)
            .with_label(format!("{}_entry", req.label_prefix));
        if req.entry_type == OrderType::Limit {
            entry_req.price = Some(
                req.entry_price
                    .map(|p| round_to_tick(p, &info))
                    .ok_or_else(|| BracketError::Rejected("limit entry requires entry_price".into()))?,
            );
        }
        let entry = Self::place_leg(broker, entry_req, leg_timeout)
            .await
            .map_err(|e| BracketError::Rejected(format!("entry rejected: {e}")))?;
        let entry_fill_price = entry.filled_price.unwrap_or(stop_loss_price);

        let mut sl_req = OrderRequest::new(req.instrument.clone(), exit_side, OrderType::StopMarket, amount);
        sl_req.trigger_price = Some(stop_loss_price);
        sl_req.reduce_only = true;
        sl_req.label = format!("{}_sl", req.label_prefix);

        let stop_loss = match Self::place_leg(broker, sl_req, leg_timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "stop-loss leg rejected, rolling back entry");
                Self::flatten(broker, &req.instrument, exit_side, amount, leg_timeout).await;
                return Err(BracketError::RolledBack(format!("stop-loss rejected: {e}")));
            }
        };

        let mut tp_req = OrderRequest::new(req.instrument.clone(), exit_side, OrderType::Limit, amount);
        tp_req.price = Some(take_profit_price);
        tp_req.reduce_only = true;
        tp_req.label = format!("{}_tp", req.label_prefix);

        let take_profit = match Self::place_leg(broker, tp_req, leg_timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "take-profit leg rejected, rolling back entry and stop-loss");
                let _ = broker.cancel_order(&stop_loss.order_id).await;
                Self::flatten(broker, &req.instrument, exit_side, amount, leg_timeout).await;
                return Err(BracketError::RolledBack(format!("take-profit rejected: {e}")));
            }
        };

        Ok(BracketResult {
            entry,
            stop_loss,
            take_profit,
            entry_fill_price,
            amount,
        })
    }

    /// Places a single leg, collapsing both a broker rejection and a
    /// timed-out placement into the same error path.
    async fn place_leg(
        broker: &Arc<dyn BrokerClient>,
        req: OrderRequest,
        leg_timeout: Duration,
    ) -> Result<OrderResult, BracketError> {
        match tokio::time::timeout(leg_timeout, broker.place_order(req)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(BracketError::Rejected(e.to_string())),
            Err(_) => Err(BracketError::Timeout),
        }
    }

    /// Best-effort close of a just-opened entry during rollback. Errors are
    /// logged, not propagated: the caller is already on the rollback path
    /// and the executor's position check plus the reconciliation service
    /// are the backstop if this also fails to land.
    async fn flatten(
        broker: &Arc<dyn BrokerClient>,
        instrument: &str,
        exit_side: Side,
        amount: f64,
        leg_timeout: Duration,
    ) {
        let flatten_req =
            OrderRequest::new(instrument, exit_side, OrderType::Market, amount).with_label("rollback_flatten");
        if let Err(e) = Self::place_leg(broker, flatten_req, leg_timeout).await {
            warn!(error = %e, instrument, "rollback flatten failed, position may be orphaned");
        }
    }
}
