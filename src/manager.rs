// =============================================================================
// Per-User Strategy Manager
// =============================================================================
//
// Owns the live `InstanceKey -> StrategyExecutor` registry for the whole
// process and is the only component callers (the thin HTTP surface, the
// binary's boot sequence) talk to: build clients, spawn per-instance tasks,
// track them, generalised from one hard-coded symbol set to arbitrary
// per-user strategy instances started and stopped at runtime.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::registry::BrokerRegistry;
use crate::config::EngineConfig;
use crate::error::ManagerError;
use crate::executor::{ExecutorCommand, ExecutorConfig, StrategyExecutor};
use crate::ledger::TradeLedger;
use crate::repository::{StrategyRecord, StrategyRepository, StrategyStatus};
use crate::strategy::StrategyRegistry;
use crate::supervisor::Supervisor;
use crate::types::{Broker, Environment, InstanceKey, UserId};

struct RunningInstance {
    cmd_tx: mpsc::Sender<ExecutorCommand>,
    join: tokio::task::JoinHandle<()>,
}

/// `Starting` reserves a key for the duration of strategy construction and
/// executor spawn, before either of those is actually running, so two
/// concurrent `start_strategy` calls for the same key can't both get past
/// the check in the gap before either inserts `Running`.
enum InstanceState {
    Starting,
    Running(RunningInstance),
}

pub struct StrategyManager {
    broker_registry: Arc<dyn BrokerRegistry>,
    strategy_registry: Arc<StrategyRegistry>,
    ledger: Arc<dyn TradeLedger>,
    repository: Arc<dyn StrategyRepository>,
    config: EngineConfig,
    running: RwLock<HashMap<InstanceKey, InstanceState>>,
}

impl StrategyManager {
    pub fn new(
        broker_registry: Arc<dyn BrokerRegistry>,
        strategy_registry: Arc<StrategyRegistry>,
        ledger: Arc<dyn TradeLedger>,
        repository: Arc<dyn StrategyRepository>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_registry,
            strategy_registry,
            ledger,
            repository,
            config,
            running: RwLock::new(HashMap::new()),
        })
    }

    /// Starts a brand-new strategy instance for a user.
    pub async fn start_strategy(
        self: &Arc<Self>,
        user_id: UserId,
        strategy_name: String,
        instrument: String,
        broker: Broker,
        environment: Environment,
        strategy_kind: String,
        params: Value,
        auto_reconnect: bool,
    ) -> Result<(), ManagerError> {
        let key = InstanceKey {
            user_id,
            strategy_name,
            instrument,
            broker,
            environment,
        };

        {
            let mut running = self.running.write();
            if running.contains_key(&key) {
                return Err(ManagerError::AlreadyRunning);
            }
            running.insert(key.clone(), InstanceState::Starting);
        }

        match self
            .start_strategy_reserved(key.clone(), strategy_kind, params, auto_reconnect)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.write().remove(&key);
                Err(e)
            }
        }
    }

    async fn start_strategy_reserved(
        self: &Arc<Self>,
        key: InstanceKey,
        strategy_kind: String,
        params: Value,
        auto_reconnect: bool,
    ) -> Result<(), ManagerError> {
        let strategy = self.strategy_registry.build(&strategy_kind, &params)?;

        let record = StrategyRecord::new(key.clone(), strategy_kind, params, auto_reconnect);
        self.repository.upsert(record).await?;

        self.spawn_executor(key, strategy).await
    }

    /// Stops a running instance gracefully: existing resting bracket orders
    /// are left alone, the executor simply stops evaluating new entries —
    /// see `executor::StrategyExecutor::run`.
    pub async fn stop_strategy(&self, key: &InstanceKey) -> Result<(), ManagerError> {
        let cmd_tx = {
            let running = self.running.read();
            match running.get(key) {
                Some(InstanceState::Running(i)) => Some(i.cmd_tx.clone()),
                _ => None,
            }
        };
        let Some(cmd_tx) = cmd_tx else {
            return self.repository.mark_stopped(key).await.map_err(ManagerError::from);
        };
        let _ = cmd_tx.send(ExecutorCommand::Stop).await;
        Ok(())
    }

    /// All persisted strategy records for a user, running or not.
    pub async fn status_for_user(&self, user_id: &UserId) -> Result<Vec<StrategyRecord>, ManagerError> {
        self.repository.list_for_user(user_id).await.map_err(ManagerError::from)
    }

    pub fn is_running(&self, key: &InstanceKey) -> bool {
        self.running.read().contains_key(key)
    }

    fn is_live(&self, key: &InstanceKey) -> bool {
        matches!(self.running.read().get(key), Some(InstanceState::Running(_)))
    }

    /// Boot-time auto-resume: every persisted record with `status = Active,
    /// auto_reconnect = true` gets its executor reconstructed. Sequential,
    /// not concurrent — a broker connection failure on one user's instance
    /// must not race another's resume attempt for the same underlying
    /// broker session.
    pub async fn initialize(self: &Arc<Self>) -> Result<usize, ManagerError> {
        let resumable = self.repository.list_resumable().await?;
        let mut resumed = 0usize;
        for record in resumable {
            if self.is_live(&record.key) {
                warn!(key = %record.key, "live instance already present for a resumable record at boot, skipping");
                continue;
            }
            let strategy = match self.strategy_registry.build(&record.strategy_kind, &record.params) {
                Ok(s) => s,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "skipping unresumable strategy record");
                    let _ = self
                        .repository
                        .update_status(&record.key, StrategyStatus::Errored, Some(e.to_string()))
                        .await;
                    continue;
                }
            };
            match self.spawn_executor(record.key.clone(), strategy).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "failed to resume strategy instance");
                    let _ = self
                        .repository
                        .update_status(&record.key, StrategyStatus::Errored, Some(e.to_string()))
                        .await;
                }
            }
        }
        info!(resumed, "auto-resume complete");
        Ok(resumed)
    }

    async fn spawn_executor(
        self: &Arc<Self>,
        key: InstanceKey,
        strategy: Arc<dyn crate::strategy::Strategy>,
    ) -> Result<(), ManagerError> {
        let broker_client = self
            .broker_registry
            .client_for(&key.user_id, key.broker, key.environment)
            .ok_or(ManagerError::NotConnected)?;

        let exec_config = ExecutorConfig {
            cooldown: self.config.default_cooldown,
            max_daily_trades: self.config.default_max_daily_trades,
            timer_interval: self.config.heartbeat,
            bracket_timeout: self.config.bracket_timeout,
        };

        let (join, cmd_tx) = StrategyExecutor::spawn(
            key.clone(),
            broker_client,
            strategy,
            self.ledger.clone(),
            self.repository.clone(),
            self.clone() as Arc<dyn Supervisor>,
            exec_config,
        )
        .await
        .map_err(|e| ManagerError::Validation(format!("failed to start executor: {e}")))?;

        self.running
            .write()
            .insert(key.clone(), InstanceState::Running(RunningInstance { cmd_tx, join }));
        let _ = self
            .repository
            .update_status(&key, StrategyStatus::Active, None)
            .await;
        Ok(())
    }
}

impl Supervisor for StrategyManager {
    fn on_executor_finished(&self, key: &InstanceKey) {
        self.running.write().remove(key);
        info!(key = %key, at = %Utc::now(), "executor instance deregistered");
    }
}
