// =============================================================================
// SQL Strategy-State Repository backend (`StoreBackend::Sql`)
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use crate::error::RepositoryError;
use crate::repository::{StrategyRecord, StrategyRepository, StrategyStatus};
use crate::types::{Broker, Environment, InstanceKey, UserId};

pub struct SqlStrategyRepository {
    pool: SqlitePool,
}

impl SqlStrategyRepository {
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| RepositoryError::Storage(format!("connect failed: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| RepositoryError::Storage(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }
}

#[derive(FromRow)]
struct StrategyRow {
    user_id: String,
    strategy_name: String,
    instrument: String,
    broker: String,
    environment: String,
    strategy_kind: String,
    params_json: String,
    status: String,
    auto_reconnect: bool,
    cooldown_until_ms: Option<i64>,
    daily_trade_count: i64,
    last_reset_date: String,
    last_error: Option<String>,
    last_heartbeat_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StrategyRow> for StrategyRecord {
    type Error = RepositoryError;

    fn try_from(row: StrategyRow) -> Result<Self, Self::Error> {
        let bad = |field: &str| RepositoryError::Storage(format!("bad {field} in row"));
        Ok(StrategyRecord {
            key: InstanceKey {
                user_id: UserId(row.user_id),
                strategy_name: row.strategy_name,
                instrument: row.instrument,
                broker: match row.broker.as_str() {
                    "deribit" => Broker::Deribit,
                    _ => return Err(bad("broker")),
                },
                environment: match row.environment.as_str() {
                    "testnet" => Environment::Testnet,
                    "mainnet" => Environment::Mainnet,
                    _ => return Err(bad("environment")),
                },
            },
            strategy_kind: row.strategy_kind,
            params: serde_json::from_str(&row.params_json).map_err(|_| bad("params_json"))?,
            status: match row.status.as_str() {
                "active" => StrategyStatus::Active,
                "stopped" => StrategyStatus::Stopped,
                "errored" => StrategyStatus::Errored,
                _ => return Err(bad("status")),
            },
            auto_reconnect: row.auto_reconnect,
            cooldown_until: row
                .cooldown_until_ms
                .and_then(|ms| DateTime::from_timestamp_millis(ms)),
            daily_trade_count: row.daily_trade_count as u32,
            last_reset_date: NaiveDate::parse_from_str(&row.last_reset_date, "%Y-%m-%d")
                .map_err(|_| bad("last_reset_date"))?,
            last_error: row.last_error,
            last_heartbeat: row.last_heartbeat_ms.and_then(DateTime::from_timestamp_millis),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl StrategyRepository for SqlStrategyRepository {
    async fn upsert(&self, record: StrategyRecord) -> Result<(), RepositoryError> {
        let params_json = serde_json::to_string(&record.params)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO strategy_state (user_id, strategy_name, instrument, broker, environment, \
             strategy_kind, params_json, status, auto_reconnect, cooldown_until_ms, daily_trade_count, \
             last_reset_date, last_heartbeat_ms, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15) \
             ON CONFLICT (user_id, strategy_name, instrument, broker, environment) DO UPDATE SET \
             strategy_kind = excluded.strategy_kind, params_json = excluded.params_json, \
             status = excluded.status, auto_reconnect = excluded.auto_reconnect, \
             cooldown_until_ms = excluded.cooldown_until_ms, daily_trade_count = excluded.daily_trade_count, \
             last_reset_date = excluded.last_reset_date, last_heartbeat_ms = excluded.last_heartbeat_ms, \
             updated_at = excluded.updated_at",
        )
        .bind(&record.key.user_id.0)
        .bind(&record.key.strategy_name)
        .bind(&record.key.instrument)
        .bind(record.key.broker.to_string())
        .bind(record.key.environment.to_string())
        .bind(&record.strategy_kind)
        .bind(params_json)
        .bind(status_str(record.status))
        .bind(record.auto_reconnect)
        .bind(record.cooldown_until.map(|d| d.timestamp_millis()))
        .bind(record.daily_trade_count as i64)
        .bind(record.last_reset_date.format("%Y-%m-%d").to_string())
        .bind(record.last_heartbeat.map(|d| d.timestamp_millis()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<StrategyRecord>, RepositoryError> {
        let row: Option<StrategyRow> = sqlx::query_as(
            "SELECT * FROM strategy_state WHERE user_id=?1 AND strategy_name=?2 AND instrument=?3 \
             AND broker=?4 AND environment=?5",
        )
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        row.map(StrategyRecord::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<StrategyRecord>, RepositoryError> {
        let rows: Vec<StrategyRow> =
            sqlx::query_as("SELECT * FROM strategy_state WHERE user_id = ?1")
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        rows.into_iter().map(StrategyRecord::try_from).collect()
    }

    async fn list_resumable(&self) -> Result<Vec<StrategyRecord>, RepositoryError> {
        let rows: Vec<StrategyRow> = sqlx::query_as(
            "SELECT * FROM strategy_state WHERE status = 'active' AND auto_reconnect = 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        rows.into_iter().map(StrategyRecord::try_from).collect()
    }

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: StrategyStatus,
        last_error: Option<String>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE strategy_state SET status=?1, last_error=?2, updated_at=?3 \
             WHERE user_id=?4 AND strategy_name=?5 AND instrument=?6 AND broker=?7 AND environment=?8",
        )
        .bind(status_str(status))
        .bind(last_error)
        .bind(Utc::now())
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn mark_stopped(&self, key: &InstanceKey) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE strategy_state SET status=?1, auto_reconnect=0, updated_at=?2 \
             WHERE user_id=?3 AND strategy_name=?4 AND instrument=?5 AND broker=?6 AND environment=?7",
        )
        .bind(status_str(StrategyStatus::Stopped))
        .bind(Utc::now())
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn update_heartbeat(&self, key: &InstanceKey, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE strategy_state SET last_heartbeat_ms=?1 \
             WHERE user_id=?2 AND strategy_name=?3 AND instrument=?4 AND broker=?5 AND environment=?6",
        )
        .bind(at.timestamp_millis())
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn set_cooldown(
        &self,
        key: &InstanceKey,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE strategy_state SET cooldown_until_ms=?1, updated_at=?2 \
             WHERE user_id=?3 AND strategy_name=?4 AND instrument=?5 AND broker=?6 AND environment=?7",
        )
        .bind(cooldown_until.map(|d| d.timestamp_millis()))
        .bind(Utc::now())
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn increment_daily_trade_count(
        &self,
        key: &InstanceKey,
        today: NaiveDate,
    ) -> Result<u32, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        let row: (i64, String) = sqlx::query_as(
            "SELECT daily_trade_count, last_reset_date FROM strategy_state \
             WHERE user_id=?1 AND strategy_name=?2 AND instrument=?3 AND broker=?4 AND environment=?5",
        )
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?
        .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;

        let stored_date = NaiveDate::parse_from_str(&row.1, "%Y-%m-%d")
            .map_err(|_| RepositoryError::Storage("bad last_reset_date in row".into()))?;
        let new_count = if stored_date != today { 1 } else { row.0 as u32 + 1 };

        sqlx::query(
            "UPDATE strategy_state SET daily_trade_count=?1, last_reset_date=?2, updated_at=?3 \
             WHERE user_id=?4 AND strategy_name=?5 AND instrument=?6 AND broker=?7 AND environment=?8",
        )
        .bind(new_count as i64)
        .bind(today.format("%Y-%m-%d").to_string())
        .bind(Utc::now())
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        tx.commit().await.map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(new_count)
    }

    async fn delete(&self, key: &InstanceKey) -> Result<(), RepositoryError> {
        sqlx::query(
            "DELETE FROM strategy_state WHERE user_id=?1 AND strategy_name=?2 AND instrument=?3 \
             AND broker=?4 AND environment=?5",
        )
        .bind(&key.user_id.0)
        .bind(&key.strategy_name)
        .bind(&key.instrument)
        .bind(key.broker.to_string())
        .bind(key.environment.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn status_str(status: StrategyStatus) -> &'static str {
    match status {
        StrategyStatus::Active => "active",
        StrategyStatus::Stopped => "stopped",
        StrategyStatus::Errored => "errored",
    }
}
