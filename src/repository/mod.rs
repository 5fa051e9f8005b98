// =============================================================================
// Strategy-State Repository
// =============================================================================
//
// Durable storage for each user's configured strategy instances — the
// persisted counterpart to a running [`crate::executor::StrategyExecutor`].
// On boot, the manager calls `list_resumable` to find every record whose
// `status` survived a prior shutdown as `Active` with `auto_reconnect = true`
// and reconstructs an executor for each.
// =============================================================================

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RepositoryError;
use crate::types::InstanceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Active,
    Stopped,
    Errored,
}

/// The durable configuration + lifecycle state of one strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub key: InstanceKey,
    pub strategy_kind: String,
    pub params: Value,
    pub status: StrategyStatus,
    pub auto_reconnect: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub daily_trade_count: u32,
    pub last_reset_date: NaiveDate,
    pub last_error: Option<String>,
    /// Last time the live executor for this key reported liveness. `None`
    /// until the instance has run for at least one heartbeat interval, or
    /// after it has stopped.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRecord {
    pub fn new(key: InstanceKey, strategy_kind: String, params: Value, auto_reconnect: bool) -> Self {
        let now = Utc::now();
        Self {
            key,
            strategy_kind,
            params,
            status: StrategyStatus::Active,
            auto_reconnect,
            cooldown_until: None,
            daily_trade_count: 0,
            last_reset_date: now.date_naive(),
            last_error: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn upsert(&self, record: StrategyRecord) -> Result<(), RepositoryError>;

    async fn get(&self, key: &InstanceKey) -> Result<Option<StrategyRecord>, RepositoryError>;

    async fn list_for_user(&self, user_id: &crate::types::UserId) -> Result<Vec<StrategyRecord>, RepositoryError>;

    /// Every record eligible for auto-resume at boot: `status = Active` and
    /// `auto_reconnect = true`.
    async fn list_resumable(&self) -> Result<Vec<StrategyRecord>, RepositoryError>;

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: StrategyStatus,
        last_error: Option<String>,
    ) -> Result<(), RepositoryError>;

    /// Sets `status=stopped` and clears `auto_reconnect` in the same write,
    /// so a stopped instance can never be picked up again by auto-resume.
    async fn mark_stopped(&self, key: &InstanceKey) -> Result<(), RepositoryError>;

    async fn update_heartbeat(&self, key: &InstanceKey, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn set_cooldown(
        &self,
        key: &InstanceKey,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;

    /// Atomically bumps the daily trade count, first resetting it to zero if
    /// `today` differs from the stored `last_reset_date`, so per-day trade
    /// caps survive restarts without leaking across days.
    async fn increment_daily_trade_count(
        &self,
        key: &InstanceKey,
        today: NaiveDate,
    ) -> Result<u32, RepositoryError>;

    async fn delete(&self, key: &InstanceKey) -> Result<(), RepositoryError>;
}
