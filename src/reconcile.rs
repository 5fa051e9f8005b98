// =============================================================================
// Reconciliation Service
// =============================================================================
//
// SAFETY POLICY: drift between our records and the exchange is logged
// loudly, and a *resting order* with no backing open trade is swept
// (cancelled) since it can only be a stale bracket leg — but an open
// *position* the ledger doesn't know about is never force-closed
// automatically. That always surfaces as a flagged orphan for an operator
// to resolve: never automatically cancel orders or close positions for
// anything touching live exposure.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::registry::BrokerRegistry;
use crate::ledger::{TradeLedger, TradeQuery, TradeStatus};
use crate::repository::StrategyRepository;
use crate::types::UserId;

/// One user/instrument's reconciliation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub user_id: String,
    pub instrument: String,
    pub orphan_orders_swept: u32,
    pub orphan_position_detected: bool,
    /// Ledger-open trades closed out as a best-effort repair because the
    /// broker no longer reports a matching position.
    pub ledger_repairs: u32,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct ReconciliationService {
    broker_registry: Arc<dyn BrokerRegistry>,
    ledger: Arc<dyn TradeLedger>,
    repository: Arc<dyn StrategyRepository>,
    /// When set, an orphan broker position with no matching ledger trade is
    /// synthesized into the ledger via `RetroactiveSync` instead of only
    /// being flagged. Off by default: synthesizing a trade record commits
    /// this process to a guess at the position's SL/TP and entry time, which
    /// an operator should confirm before it's made durable.
    auto_sync_orphans: bool,
}

impl ReconciliationService {
    pub fn new(
        broker_registry: Arc<dyn BrokerRegistry>,
        ledger: Arc<dyn TradeLedger>,
        repository: Arc<dyn StrategyRepository>,
    ) -> Self {
        Self {
            broker_registry,
            ledger,
            repository,
            auto_sync_orphans: false,
        }
    }

    pub fn with_auto_sync_orphans(mut self, enabled: bool) -> Self {
        self.auto_sync_orphans = enabled;
        self
    }

    /// Reconciles every persisted strategy record for `user_id` against its
    /// broker's live orders and positions.
    pub async fn reconcile_user(&self, user_id: &UserId) -> Vec<ReconcileReport> {
        let records = match self.repository.list_for_user(user_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, %user_id, "reconciliation failed to load strategy records");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for record in records {
            let Some(client) = self
                .broker_registry
                .client_for(user_id, record.key.broker, record.key.environment)
            else {
                continue;
            };

            let open_trade = self
                .ledger
                .find_open(user_id, &record.key.strategy_name, &record.key.instrument)
                .await
                .ok()
                .flatten();

            let open_orders = client.list_open_orders(&record.key.instrument).await.unwrap_or_default();
            let mut swept = 0u32;
            if open_trade.is_none() {
                for order in &open_orders {
                    match client.cancel_order(&order.order_id).await {
                        Ok(()) => {
                            swept += 1;
                            info!(order_id = %order.order_id, instrument = %record.key.instrument, "swept orphan resting order");
                        }
                        Err(e) => warn!(error = %e, order_id = %order.order_id, "failed to sweep orphan order"),
                    }
                }
            }

            let currency = record
                .key
                .instrument
                .split('-')
                .next()
                .unwrap_or(&record.key.instrument);
            let positions = client.list_positions(currency).await.unwrap_or_default();
            let broker_has_position = positions
                .iter()
                .any(|p| p.instrument == record.key.instrument && !p.is_flat());

            let mut repaired = 0u32;
            if let Some(trade) = &open_trade {
                if !broker_has_position {
                    // Best-effort: no live ticker price is available here, so
                    // the trade's own entry price stands in for the exit
                    // price and realized PnL is reported as zero.
                    match self
                        .ledger
                        .record_close(trade.id, trade.entry_price, "manual".to_string(), 0.0)
                        .await
                    {
                        Ok(()) => {
                            repaired += 1;
                            info!(
                                trade_id = %trade.id,
                                instrument = %record.key.instrument,
                                "closed ledger trade with no matching broker position"
                            );
                        }
                        Err(e) => warn!(error = %e, trade_id = %trade.id, "failed to repair stale open trade"),
                    }
                }
            }

            let orphan_position = broker_has_position && open_trade.is_none();
            if orphan_position {
                if self.auto_sync_orphans {
                    let position = positions
                        .iter()
                        .find(|p| p.instrument == record.key.instrument && !p.is_flat())
                        .expect("broker_has_position implies a matching position exists");
                    let side = if position.size > 0.0 { crate::types::Side::Buy } else { crate::types::Side::Sell };
                    let stop_loss = open_orders
                        .iter()
                        .find(|o| o.label.ends_with("_sl"))
                        .and_then(|o| o.trigger_price);
                    let take_profit = open_orders.iter().find(|o| o.label.ends_with("_tp")).and_then(|o| o.price);
                    // Neither the position nor its resting legs carry the
                    // original fill price, so the midpoint of the recovered
                    // SL/TP stands in for the entry price.
                    let entry_price = match (stop_loss, take_profit) {
                        (Some(sl), Some(tp)) => (sl + tp) / 2.0,
                        (Some(sl), None) => sl,
                        (None, Some(tp)) => tp,
                        (None, None) => 0.0,
                    };
                    match self
                        .ledger
                        .retroactive_sync(
                            user_id,
                            &record.key.strategy_name,
                            &record.key.instrument,
                            record.key.broker,
                            record.key.environment,
                            side,
                            entry_price,
                            position.size.abs(),
                            stop_loss.unwrap_or(0.0),
                            take_profit.unwrap_or(0.0),
                            Utc::now(),
                        )
                        .await
                    {
                        Ok(trade_id) => info!(trade_id = %trade_id, instrument = %record.key.instrument, "synthesized ledger row for orphan position"),
                        Err(e) => warn!(error = %e, instrument = %record.key.instrument, "failed to synthesize ledger row for orphan position"),
                    }
                } else {
                    warn!(
                        instrument = %record.key.instrument,
                        %user_id,
                        "orphan position detected on broker with no matching open trade — operator action required"
                    );
                }
            }

            reports.push(ReconcileReport {
                user_id: user_id.to_string(),
                instrument: record.key.instrument.clone(),
                orphan_orders_swept: swept,
                orphan_position_detected: orphan_position,
                ledger_repairs: repaired,
                timestamp: Utc::now(),
            });
        }
        reports
    }

    /// Cancels resting orders that have no backing open trade, without the
    /// rest of `reconcile_user`'s work. Meant to run on a much tighter
    /// cadence than the full reconciliation pass, so a stale bracket leg
    /// left over from a crashed rollback doesn't sit on the book for minutes.
    pub async fn sweep_orphan_orders(&self, user_id: &UserId) -> u32 {
        let records = match self.repository.list_for_user(user_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, %user_id, "orphan sweep failed to load strategy records");
                return 0;
            }
        };

        let mut swept = 0u32;
        for record in records {
            let Some(client) = self
                .broker_registry
                .client_for(user_id, record.key.broker, record.key.environment)
            else {
                continue;
            };

            let open_trade = self
                .ledger
                .find_open(user_id, &record.key.strategy_name, &record.key.instrument)
                .await
                .ok()
                .flatten();
            if open_trade.is_some() {
                continue;
            }

            let open_orders = client.list_open_orders(&record.key.instrument).await.unwrap_or_default();
            for order in &open_orders {
                match client.cancel_order(&order.order_id).await {
                    Ok(()) => {
                        swept += 1;
                        info!(order_id = %order.order_id, instrument = %record.key.instrument, "swept orphan resting order");
                    }
                    Err(e) => warn!(error = %e, order_id = %order.order_id, "failed to sweep orphan order"),
                }
            }
        }
        swept
    }

    /// Cross-checks the ledger's notion of "currently open" trades against
    /// itself — flags any open trade record older than `stale_after` that
    /// never closed, a sign the executor that owned it crashed without
    /// reconciling.
    pub async fn find_stale_open_trades(
        &self,
        user_id: &UserId,
        stale_after: chrono::Duration,
    ) -> Vec<crate::ledger::TradeRecord> {
        let trades = self
            .ledger
            .query_trades(
                user_id,
                TradeQuery {
                    status: Some(TradeStatus::Open),
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_default();

        let cutoff = Utc::now() - stale_after;
        trades.into_iter().filter(|t| t.opened_at < cutoff).collect()
    }
}
