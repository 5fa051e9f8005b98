// =============================================================================
// In-memory Trade Ledger backend
// =============================================================================
//
// Keeps two plain `RwLock<Vec<TradeRecord>>` collections, open and closed.
// Used for tests and for `StoreBackend::Memory` deployments where
// restart-durability of trade history is not required.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{compute_stats, TradeLedger, TradeQuery, TradeRecord, TradeStats, TradeStatus};
use crate::types::{Broker, Environment, Side, UserId};

#[derive(Default)]
pub struct InMemoryTradeLedger {
    trades: RwLock<Vec<TradeRecord>>,
}

impl InMemoryTradeLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeLedger for InMemoryTradeLedger {
    async fn record_open(&self, trade: TradeRecord) -> Result<Uuid, LedgerError> {
        let mut trades = self.trades.write();
        let conflict = trades.iter().any(|t| {
            t.status == TradeStatus::Open
                && t.user_id == trade.user_id
                && t.strategy_name == trade.strategy_name
                && t.instrument == trade.instrument
        });
        if conflict {
            return Err(LedgerError::LedgerConflict);
        }
        let id = trade.id;
        trades.push(trade);
        Ok(id)
    }

    async fn record_close(
        &self,
        trade_id: Uuid,
        exit_price: f64,
        close_reason: String,
        realized_pnl: f64,
    ) -> Result<(), LedgerError> {
        let mut trades = self.trades.write();
        let trade = trades
            .iter_mut()
            .find(|t| t.id == trade_id)
            .ok_or_else(|| LedgerError::NotFound(trade_id.to_string()))?;
        if trade.status == TradeStatus::Closed {
            return Err(LedgerError::AlreadyClosed(trade_id.to_string()));
        }
        let denom = trade.entry_price * trade.quantity;
        trade.status = TradeStatus::Closed;
        trade.closed_at = Some(Utc::now());
        trade.exit_price = Some(exit_price);
        trade.close_reason = Some(close_reason);
        trade.realized_pnl = Some(realized_pnl);
        trade.pnl_percent = if denom != 0.0 { Some(realized_pnl / denom) } else { None };
        Ok(())
    }

    async fn find_open(
        &self,
        user_id: &UserId,
        strategy_name: &str,
        instrument: &str,
    ) -> Result<Option<TradeRecord>, LedgerError> {
        Ok(self
            .trades
            .read()
            .iter()
            .find(|t| {
                t.status == TradeStatus::Open
                    && &t.user_id == user_id
                    && t.strategy_name == strategy_name
                    && t.instrument == instrument
            })
            .cloned())
    }

    async fn query_trades(
        &self,
        user_id: &UserId,
        query: TradeQuery,
    ) -> Result<Vec<TradeRecord>, LedgerError> {
        let trades = self.trades.read();
        let mut matched: Vec<TradeRecord> = trades
            .iter()
            .filter(|t| &t.user_id == user_id)
            .filter(|t| query.strategy_name.as_deref().map_or(true, |s| s == t.strategy_name))
            .filter(|t| query.instrument.as_deref().map_or(true, |i| i == t.instrument))
            .filter(|t| query.status.map_or(true, |s| s == t.status))
            .cloned()
            .collect();
        matched.sort_by_key(|t| std::cmp::Reverse(t.opened_at));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn trade_stats(&self, user_id: &UserId) -> Result<TradeStats, LedgerError> {
        let trades = self.trades.read();
        let user_trades: Vec<TradeRecord> =
            trades.iter().filter(|t| &t.user_id == user_id).cloned().collect();
        Ok(compute_stats(&user_trades))
    }

    async fn retroactive_sync(
        &self,
        user_id: &UserId,
        strategy_name: &str,
        instrument: &str,
        broker: Broker,
        environment: Environment,
        side: Side,
        entry_price: f64,
        amount: f64,
        stop_loss: f64,
        take_profit: f64,
        entry_time: chrono::DateTime<Utc>,
    ) -> Result<Uuid, LedgerError> {
        let trade = TradeRecord::retroactive(
            user_id.clone(),
            strategy_name.to_string(),
            instrument.to_string(),
            broker,
            environment,
            side,
            entry_price,
            amount,
            stop_loss,
            take_profit,
            entry_time,
        );
        let id = trade.id;
        self.trades.write().push(trade);
        Ok(id)
    }
}
