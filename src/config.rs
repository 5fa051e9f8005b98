// =============================================================================
// Process-wide configuration
// =============================================================================
//
// Environment-variable shaped, read once at startup rather than hot-reloaded
// from a file on disk. Every field carries a sane default so a bare
// `EngineConfig::from_env()` is always enough to boot in `memory` + testnet
// mode.
// =============================================================================

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Selects the backing store for the Trade Ledger and Strategy-State
/// Repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sql,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Memory
    }
}

/// Process-wide configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ledger/repository backing store.
    pub store_backend: StoreBackend,
    /// Connection string for the strategy-state store (sql backend only).
    pub state_db_url: String,
    /// Location of the ledger store (sql backend only).
    pub trade_db_path: String,

    pub heartbeat: Duration,
    pub reconcile_interval: Duration,
    pub orphan_sweep_interval: Duration,

    pub default_cooldown: Duration,
    pub default_max_daily_trades: u32,

    pub bracket_timeout: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs_or(key: &str, default: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_millis_or(key: &str, default: u64) -> Duration {
    let millis = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_millis(millis)
}

fn env_u32_or(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("sql") => StoreBackend::Sql,
            _ => StoreBackend::Memory,
        };

        Self {
            store_backend,
            state_db_url: env_or("STATE_DB_URL", "sqlite://state.db"),
            trade_db_path: env_or("TRADE_DB_PATH", "sqlite://trades.db"),
            heartbeat: env_secs_or("HEARTBEAT_SECONDS", 30),
            reconcile_interval: env_secs_or("RECONCILE_SECONDS", 300),
            orphan_sweep_interval: env_secs_or("ORPHAN_SWEEP_SECONDS", 60),
            default_cooldown: env_secs_or("DEFAULT_COOLDOWN_MINUTES", 5 * 60),
            default_max_daily_trades: env_u32_or("DEFAULT_MAX_DAILY_TRADES", 150),
            bracket_timeout: env_millis_or("BRACKET_TIMEOUT_MS", 5000),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::default(),
            state_db_url: "sqlite://state.db".to_string(),
            trade_db_path: "sqlite://trades.db".to_string(),
            heartbeat: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            orphan_sweep_interval: Duration::from_secs(60),
            default_cooldown: Duration::from_secs(5 * 60),
            default_max_daily_trades: 150,
            bracket_timeout: Duration::from_millis(5000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.heartbeat, Duration::from_secs(30));
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(300));
        assert_eq!(cfg.orphan_sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.default_cooldown, Duration::from_secs(300));
        assert_eq!(cfg.default_max_daily_trades, 150);
        assert_eq!(cfg.bracket_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn env_var_overrides_default() {
        env::set_var("DEFAULT_MAX_DAILY_TRADES", "42");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.default_max_daily_trades, 42);
        env::remove_var("DEFAULT_MAX_DAILY_TRADES");
    }
}
