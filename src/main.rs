// =============================================================================
// aurora-perp-core — Main Entry Point
// =============================================================================
//
// Boots the strategy-execution core: loads config from the environment,
// wires the ledger/repository backends, resumes every strategy instance
// that was active before the last shutdown, then serves the thin HTTP
// surface until Ctrl-C.
// =============================================================================

mod analysis;
mod api;
mod bracket;
mod broker;
mod config;
mod error;
mod executor;
mod indicators;
mod ledger;
mod manager;
mod reconcile;
mod repository;
mod strategy;
mod supervisor;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiState;
use crate::broker::deribit::DeribitClient;
use crate::broker::registry::InMemoryBrokerRegistry;
use crate::config::{EngineConfig, StoreBackend};
use crate::ledger::memory::InMemoryTradeLedger;
use crate::ledger::sql::SqlTradeLedger;
use crate::ledger::TradeLedger;
use crate::manager::StrategyManager;
use crate::reconcile::ReconciliationService;
use crate::repository::memory::InMemoryStrategyRepository;
use crate::repository::sql::SqlStrategyRepository;
use crate::repository::StrategyRepository;
use crate::strategy::StrategyRegistry;
use crate::types::{Broker, Environment, UserId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-perp-core starting up");

    let config = EngineConfig::from_env();

    let ledger: Arc<dyn TradeLedger> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryTradeLedger::new()),
        StoreBackend::Sql => Arc::new(SqlTradeLedger::connect(&config.trade_db_path).await?),
    };
    let repository: Arc<dyn StrategyRepository> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryStrategyRepository::new()),
        StoreBackend::Sql => Arc::new(SqlStrategyRepository::connect(&config.state_db_url).await?),
    };

    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    bootstrap_default_broker(&broker_registry);

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    info!(kinds = ?strategy_registry.known_kinds(), "strategy registry loaded");

    let manager = StrategyManager::new(
        broker_registry.clone(),
        strategy_registry,
        ledger.clone(),
        repository.clone(),
        config.clone(),
    );

    let resumed = manager.initialize().await?;
    info!(resumed, "auto-resume pass complete");

    let reconciliation = Arc::new(ReconciliationService::new(
        broker_registry.clone(),
        ledger.clone(),
        repository.clone(),
    ));
    spawn_reconciliation_loop(reconciliation.clone(), repository.clone(), config.reconcile_interval);
    spawn_orphan_sweep_loop(reconciliation, repository.clone(), config.orphan_sweep_interval);

    let api_state = ApiState {
        manager: manager.clone(),
        ledger: ledger.clone(),
    };
    let app = api::rest::router(api_state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "http api listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "http server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}

/// Registers a single Deribit client for a demo/default user from
/// environment credentials, if present. Real multi-user credential
/// onboarding is an external collaborator to this crate's broker registry —
/// this is only a convenience bootstrap for running the engine standalone.
fn bootstrap_default_broker(registry: &Arc<InMemoryBrokerRegistry>) {
    let (Ok(client_id), Ok(client_secret)) = (
        std::env::var("DERIBIT_CLIENT_ID"),
        std::env::var("DERIBIT_CLIENT_SECRET"),
    ) else {
        info!("no DERIBIT_CLIENT_ID/SECRET set, skipping default broker bootstrap");
        return;
    };
    let testnet = std::env::var("DERIBIT_TESTNET").map(|v| v != "false").unwrap_or(true);
    let user_id = UserId::from(std::env::var("DEFAULT_USER_ID").unwrap_or_else(|_| "default".to_string()));
    let environment = if testnet { Environment::Testnet } else { Environment::Mainnet };

    let client = Arc::new(DeribitClient::new(client_id, client_secret, testnet));
    registry.register(user_id, Broker::Deribit, environment, client);
    info!(environment = %environment, "registered default deribit broker client");
}

fn spawn_reconciliation_loop(
    service: Arc<ReconciliationService>,
    repository: Arc<dyn StrategyRepository>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let users = match all_known_user_ids(&repository).await {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "reconciliation loop failed to enumerate users");
                    continue;
                }
            };
            for user_id in users {
                let reports = service.reconcile_user(&user_id).await;
                for report in reports {
                    if report.orphan_position_detected || report.orphan_orders_swept > 0 {
                        info!(?report, "reconciliation found drift");
                    }
                }
            }
        }
    });
}

/// Runs the lightweight orphan-order sweep on its own, tighter cadence —
/// separate from the full `spawn_reconciliation_loop` pass, since cancelling
/// a stale bracket leg shouldn't wait for the slower drift-detection sweep.
fn spawn_orphan_sweep_loop(
    service: Arc<ReconciliationService>,
    repository: Arc<dyn StrategyRepository>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let users = match all_known_user_ids(&repository).await {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "orphan sweep loop failed to enumerate users");
                    continue;
                }
            };
            for user_id in users {
                let swept = service.sweep_orphan_orders(&user_id).await;
                if swept > 0 {
                    info!(%user_id, swept, "orphan sweep cancelled stray resting orders");
                }
            }
        }
    });
}

async fn all_known_user_ids(repository: &Arc<dyn StrategyRepository>) -> anyhow::Result<Vec<UserId>> {
    let resumable = repository.list_resumable().await?;
    let mut ids: Vec<UserId> = resumable.into_iter().map(|r| r.key.user_id).collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
