// =============================================================================
// In-memory Strategy-State Repository backend
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;

use crate::error::RepositoryError;
use crate::repository::{StrategyRecord, StrategyRepository, StrategyStatus};
use crate::types::{InstanceKey, UserId};

#[derive(Default)]
pub struct InMemoryStrategyRepository {
    records: RwLock<HashMap<InstanceKey, StrategyRecord>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn upsert(&self, record: StrategyRecord) -> Result<(), RepositoryError> {
        self.records.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<StrategyRecord>, RepositoryError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<StrategyRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.key.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_resumable(&self) -> Result<Vec<StrategyRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.status == StrategyStatus::Active && r.auto_reconnect)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: StrategyStatus,
        last_error: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        record.status = status;
        record.last_error = last_error;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_stopped(&self, key: &InstanceKey) -> Result<(), RepositoryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        record.status = StrategyStatus::Stopped;
        record.auto_reconnect = false;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_heartbeat(&self, key: &InstanceKey, at: chrono::DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        record.last_heartbeat = Some(at);
        Ok(())
    }

    async fn set_cooldown(
        &self,
        key: &InstanceKey,
        cooldown_until: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        record.cooldown_until = cooldown_until;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_daily_trade_count(
        &self,
        key: &InstanceKey,
        today: NaiveDate,
    ) -> Result<u32, RepositoryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        if record.last_reset_date != today {
            record.daily_trade_count = 0;
            record.last_reset_date = today;
        }
        record.daily_trade_count += 1;
        record.updated_at = Utc::now();
        Ok(record.daily_trade_count)
    }

    async fn delete(&self, key: &InstanceKey) -> Result<(), RepositoryError> {
        self.records.write().remove(key);
        Ok(())
    }
}
