// =============================================================================
// Trade Ledger
// =============================================================================
//
// A durable, append-mostly history of every trade the engine has opened and
// closed, keyed by the user. Open/closed state mutates in place behind a
// trait so the backing store can be swapped between an in-memory map (tests,
// single-process demo mode) and a real SQL table without anything above it
// noticing.
// =============================================================================

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::types::{Broker, Environment, Side, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// One round-trip (or in-progress) trade. Created on entry fill, updated on
/// exit fill; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub strategy_name: String,
    pub instrument: String,
    pub broker: Broker,
    pub environment: Environment,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
}

impl TradeRecord {
    pub fn open(
        user_id: UserId,
        strategy_name: String,
        instrument: String,
        broker: Broker,
        environment: Environment,
        side: Side,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            strategy_name,
            instrument,
            broker,
            environment,
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            close_reason: None,
            realized_pnl: None,
            pnl_percent: None,
        }
    }

    /// Constructs an already-open trade for a broker position this process
    /// did not witness being opened, used by reconciliation to backfill a
    /// ledger row for an orphaned position.
    #[allow(clippy::too_many_arguments)]
    pub fn retroactive(
        user_id: UserId,
        strategy_name: String,
        instrument: String,
        broker: Broker,
        environment: Environment,
        side: Side,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            strategy_name,
            instrument,
            broker,
            environment,
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            status: TradeStatus::Open,
            opened_at: entry_time,
            closed_at: None,
            exit_price: None,
            close_reason: None,
            realized_pnl: None,
            pnl_percent: None,
        }
    }
}

/// Aggregate statistics over a user's trade history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TradeStats {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_realized_pnl: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub best: f64,
    pub worst: f64,
    pub sl_hits: u64,
    pub tp_hits: u64,
}

/// Optional filters for [`TradeLedger::query_trades`].
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub strategy_name: Option<String>,
    pub instrument: Option<String>,
    pub status: Option<TradeStatus>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Appends a new open trade. Returns [`LedgerError::LedgerConflict`] if an
    /// open trade already exists for `(user, strategy_name, instrument)` —
    /// the single-open-position-per-key invariant is enforced here as well
    /// as in the executor, since the ledger is the durable source of truth
    /// across restarts.
    async fn record_open(&self, trade: TradeRecord) -> Result<Uuid, LedgerError>;

    /// Marks an open trade closed. Idempotent against `AlreadyClosed`.
    async fn record_close(
        &self,
        trade_id: Uuid,
        exit_price: f64,
        close_reason: String,
        realized_pnl: f64,
    ) -> Result<(), LedgerError>;

    /// The single open trade for `(user, strategy_name, instrument)`, if any.
    async fn find_open(
        &self,
        user_id: &UserId,
        strategy_name: &str,
        instrument: &str,
    ) -> Result<Option<TradeRecord>, LedgerError>;

    async fn query_trades(
        &self,
        user_id: &UserId,
        query: TradeQuery,
    ) -> Result<Vec<TradeRecord>, LedgerError>;

    async fn trade_stats(&self, user_id: &UserId) -> Result<TradeStats, LedgerError>;

    /// Records an existing broker position whose opening this process did
    /// not witness, used by reconciliation to backfill a ledger row for an
    /// orphaned position rather than force-closing it.
    #[allow(clippy::too_many_arguments)]
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
        entry_time: DateTime<Utc>,
    ) -> Result<Uuid, LedgerError>;
}

pub(crate) fn compute_stats(trades: &[TradeRecord]) -> TradeStats {
    let mut stats = TradeStats::default();
    let mut best = f64::MIN;
    let mut worst = f64::MAX;
    for t in trades.iter().filter(|t| t.status == TradeStatus::Closed) {
        let pnl = t.realized_pnl.unwrap_or(0.0);
        stats.total_trades += 1;
        stats.total_realized_pnl += pnl;
        if pnl >= 0.0 {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }
        best = best.max(pnl);
        worst = worst.min(pnl);
        match t.close_reason.as_deref() {
            Some("stop_loss") => stats.sl_hits += 1,
            Some("take_profit") => stats.tp_hits += 1,
            _ => {}
        }
    }
    if stats.total_trades > 0 {
        stats.win_rate = stats.wins as f64 / stats.total_trades as f64;
        stats.avg_pnl = stats.total_realized_pnl / stats.total_trades as f64;
        stats.best = best;
        stats.worst = worst;
    }
    stats
}
