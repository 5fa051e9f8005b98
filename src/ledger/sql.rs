// =============================================================================
// SQL Trade Ledger backend (`StoreBackend::Sql`)
// =============================================================================
//
// None of the five candidate teacher repos persist trade history to a SQL
// database, so this backend is grounded instead in the sqlx usage pattern
// from `other_examples/e37c2f28_sehyunsix-six-trading` (`sqlx::migrate!`
// against a pool at startup, `query_as` with a `FromRow` struct for reads).
// Uses `sqlx::query` / `query_as` (runtime-checked) rather than the
// compile-time `query!` macro family, since there is no live database to
// check queries against during this build.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{compute_stats, TradeLedger, TradeQuery, TradeRecord, TradeStats, TradeStatus};
use crate::types::{Broker, Environment, Side, UserId};

pub struct SqlTradeLedger {
    pool: SqlitePool,
}

impl SqlTradeLedger {
    /// Connects and applies pending migrations under `./migrations`.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| LedgerError::Storage(format!("connect failed: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| LedgerError::Storage(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }
}

#[derive(FromRow)]
struct TradeRow {
    id: String,
    user_id: String,
    strategy_name: String,
    instrument: String,
    broker: String,
    environment: String,
    side: String,
    entry_price: f64,
    quantity: f64,
    stop_loss: f64,
    take_profit: f64,
    status: String,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    exit_price: Option<f64>,
    close_reason: Option<String>,
    realized_pnl: Option<f64>,
    pnl_percent: Option<f64>,
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let parse_err = |field: &str| LedgerError::Storage(format!("bad {field} in row"));
        Ok(TradeRecord {
            id: Uuid::parse_str(&row.id).map_err(|_| parse_err("id"))?,
            user_id: UserId(row.user_id),
            strategy_name: row.strategy_name,
            instrument: row.instrument,
            broker: match row.broker.as_str() {
                "deribit" => Broker::Deribit,
                _ => return Err(parse_err("broker")),
            },
            environment: match row.environment.as_str() {
                "testnet" => Environment::Testnet,
                "mainnet" => Environment::Mainnet,
                _ => return Err(parse_err("environment")),
            },
            side: match row.side.as_str() {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                _ => return Err(parse_err("side")),
            },
            entry_price: row.entry_price,
            quantity: row.quantity,
            stop_loss: row.stop_loss,
            take_profit: row.take_profit,
            status: match row.status.as_str() {
                "open" => TradeStatus::Open,
                "closed" => TradeStatus::Closed,
                _ => return Err(parse_err("status")),
            },
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            exit_price: row.exit_price,
            close_reason: row.close_reason,
            realized_pnl: row.realized_pnl,
            pnl_percent: row.pnl_percent,
        })
    }
}

#[async_trait]
impl TradeLedger for SqlTradeLedger {
    async fn record_open(&self, trade: TradeRecord) -> Result<Uuid, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM trades WHERE user_id = ?1 AND strategy_name = ?2 AND instrument = ?3 AND status = 'open'",
        )
        .bind(trade.user_id.0.clone())
        .bind(&trade.strategy_name)
        .bind(&trade.instrument)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;

        if existing.is_some() {
            return Err(LedgerError::LedgerConflict);
        }

        let insert = sqlx::query(
            "INSERT INTO trades (id, user_id, strategy_name, instrument, broker, environment, side, \
             entry_price, quantity, stop_loss, take_profit, status, opened_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'open', ?12)",
        )
        .bind(trade.id.to_string())
        .bind(trade.user_id.0.clone())
        .bind(&trade.strategy_name)
        .bind(&trade.instrument)
        .bind(trade.broker.to_string())
        .bind(trade.environment.to_string())
        .bind(trade.side.to_string())
        .bind(trade.entry_price)
        .bind(trade.quantity)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.opened_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            let is_unique_violation = e
                .as_database_error()
                .map(|de| matches!(de.kind(), sqlx::error::ErrorKind::UniqueViolation))
                .unwrap_or(false);
            return Err(if is_unique_violation {
                LedgerError::LedgerConflict
            } else {
                LedgerError::Storage(e.to_string())
            });
        }

        tx.commit().await.map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(trade.id)
    }

    async fn record_close(
        &self,
        trade_id: Uuid,
        exit_price: f64,
        close_reason: String,
        realized_pnl: f64,
    ) -> Result<(), LedgerError> {
        let row = sqlx::query("SELECT status, entry_price, quantity FROM trades WHERE id = ?1")
            .bind(trade_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or_else(|| LedgerError::NotFound(trade_id.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| LedgerError::Storage(e.to_string()))?;
        if status == "closed" {
            return Err(LedgerError::AlreadyClosed(trade_id.to_string()));
        }
        let entry_price: f64 = row.try_get("entry_price").map_err(|e| LedgerError::Storage(e.to_string()))?;
        let quantity: f64 = row.try_get("quantity").map_err(|e| LedgerError::Storage(e.to_string()))?;
        let denom = entry_price * quantity;
        let pnl_percent = if denom != 0.0 { Some(realized_pnl / denom) } else { None };

        sqlx::query(
            "UPDATE trades SET status = 'closed', closed_at = ?1, exit_price = ?2, \
             close_reason = ?3, realized_pnl = ?4, pnl_percent = ?5 WHERE id = ?6",
        )
        .bind(Utc::now())
        .bind(exit_price)
        .bind(close_reason)
        .bind(realized_pnl)
        .bind(pnl_percent)
        .bind(trade_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn find_open(
        &self,
        user_id: &UserId,
        strategy_name: &str,
        instrument: &str,
    ) -> Result<Option<TradeRecord>, LedgerError> {
        let row: Option<TradeRow> = sqlx::query_as(
            "SELECT * FROM trades WHERE user_id = ?1 AND strategy_name = ?2 AND instrument = ?3 AND status = 'open'",
        )
        .bind(&user_id.0)
        .bind(strategy_name)
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn query_trades(
        &self,
        user_id: &UserId,
        query: TradeQuery,
    ) -> Result<Vec<TradeRecord>, LedgerError> {
        let rows: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE user_id = ?1 ORDER BY opened_at DESC")
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let mut records = rows
            .into_iter()
            .map(TradeRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        records.retain(|t| {
            query.strategy_name.as_deref().map_or(true, |s| s == t.strategy_name)
                && query.instrument.as_deref().map_or(true, |i| i == t.instrument)
                && query.status.map_or(true, |s| s == t.status)
        });
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn trade_stats(&self, user_id: &UserId) -> Result<TradeStats, LedgerError> {
        let rows: Vec<TradeRow> = sqlx::query_as("SELECT * FROM trades WHERE user_id = ?1")
            .bind(&user_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let records = rows
            .into_iter()
            .map(TradeRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(compute_stats(&records))
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
        entry_time: DateTime<Utc>,
    ) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO trades (id, user_id, strategy_name, instrument, broker, environment, side, \
             entry_price, quantity, stop_loss, take_profit, status, opened_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'open', ?12)",
        )
        .bind(id.to_string())
        .bind(&user_id.0)
        .bind(strategy_name)
        .bind(instrument)
        .bind(broker.to_string())
        .bind(environment.to_string())
        .bind(side.to_string())
        .bind(entry_price)
        .bind(amount)
        .bind(stop_loss)
        .bind(take_profit)
        .bind(entry_time)
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(id)
    }
}
