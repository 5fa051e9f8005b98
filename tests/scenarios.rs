// =============================================================================
// Scenario tests — exercise the testable properties the core promises
// =============================================================================
//
// Each test drives real component implementations (`BracketOrchestrator`,
// the in-memory ledger/repository, `StrategyManager`) against
// `broker::mock::MockBroker` rather than mocking the components themselves.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use aurora_perp_core::bracket::{BracketOrchestrator, BracketRequest};
use aurora_perp_core::broker::mock::MockBroker;
use aurora_perp_core::broker::registry::{BrokerRegistry, InMemoryBrokerRegistry};
use aurora_perp_core::broker::{BrokerClient, InstrumentInfo, OrderType};
use aurora_perp_core::config::EngineConfig;
use aurora_perp_core::error::{LedgerError, RepositoryError};
use aurora_perp_core::ledger::memory::InMemoryTradeLedger;
use aurora_perp_core::ledger::{TradeLedger, TradeRecord};
use aurora_perp_core::manager::StrategyManager;
use aurora_perp_core::reconcile::ReconciliationService;
use aurora_perp_core::repository::memory::InMemoryStrategyRepository;
use aurora_perp_core::repository::StrategyRepository;
use aurora_perp_core::strategy::StrategyRegistry;
use aurora_perp_core::types::{Broker, Environment, InstanceKey, Side, UserId};

fn instrument_info() -> InstrumentInfo {
    InstrumentInfo {
        tick_size: 0.5,
        min_trade_amount: 0.1,
        contract_size: 1.0,
    }
}

/// S1 — a clean bracket placement lands all three legs and rounds prices to
/// the instrument's tick size.
#[tokio::test]
async fn bracket_places_entry_and_both_protective_legs() {
    let broker = Arc::new(MockBroker::new());
    broker.set_instrument("BTC-PERPETUAL", instrument_info());
    broker.push_price("BTC-PERPETUAL", 50000.0).await;
    let client: Arc<dyn BrokerClient> = broker.clone();

    let req = BracketRequest {
        instrument: "BTC-PERPETUAL".to_string(),
        side: Side::Buy,
        amount: 1.0,
        entry_type: OrderType::Market,
        entry_price: None,
        stop_loss_price: 49500.33,
        take_profit_price: 50600.17,
        reference_price: 50000.0,
        label_prefix: "s1".to_string(),
    };

    let result = BracketOrchestrator::place_bracket(&client, req, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.entry.filled);
    assert_eq!(broker.open_order_count("BTC-PERPETUAL"), 2);
    // Rounded to the nearest 0.5 tick.
    assert_eq!(result.stop_loss.order_id.is_empty(), false);
    assert_eq!(result.take_profit.order_id.is_empty(), false);
}

/// S2 — a rejected take-profit leg rolls back the stop-loss order and
/// flattens the entry, leaving no resting orders and a flat book.
#[tokio::test]
async fn bracket_rolls_back_when_take_profit_leg_is_rejected() {
    let broker = Arc::new(MockBroker::new());
    broker.set_instrument("ETH-PERPETUAL", instrument_info());
    broker.push_price("ETH-PERPETUAL", 3000.0).await;
    broker.reject_label_suffix("_tp");
    let client: Arc<dyn BrokerClient> = broker.clone();

    let req = BracketRequest {
        instrument: "ETH-PERPETUAL".to_string(),
        side: Side::Sell,
        amount: 2.0,
        entry_type: OrderType::Market,
        entry_price: None,
        stop_loss_price: 3050.0,
        take_profit_price: 2900.0,
        reference_price: 3000.0,
        label_prefix: "s2".to_string(),
    };

    let err = BracketOrchestrator::place_bracket(&client, req, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, aurora_perp_core::error::BracketError::RolledBack(_)));
    // The stop-loss leg was cancelled and the flatten order leaves no resting orders.
    assert_eq!(broker.open_order_count("ETH-PERPETUAL"), 0);
    // Flattening a short entry (sell) with a buy closes it back to zero.
    let positions = client.list_positions("ETH").await.unwrap();
    let net: f64 = positions.iter().map(|p| p.size).sum();
    assert!(net.abs() < 1e-9, "expected flat position after rollback, got {net}");
}

/// The ledger refuses to open a second trade for the same
/// (user, strategy, instrument) while one is already open.
#[tokio::test]
async fn ledger_rejects_concurrent_open_trade_for_same_key() {
    let ledger = InMemoryTradeLedger::new();
    let user = UserId::from("alice");

    let first = TradeRecord::open(
        user.clone(),
        "razor".into(),
        "BTC-PERPETUAL".into(),
        Broker::Deribit,
        Environment::Testnet,
        Side::Buy,
        50000.0,
        1.0,
        49000.0,
        51000.0,
    );
    ledger.record_open(first).await.unwrap();

    let second = TradeRecord::open(
        user,
        "razor".into(),
        "BTC-PERPETUAL".into(),
        Broker::Deribit,
        Environment::Testnet,
        Side::Buy,
        50010.0,
        1.0,
        49010.0,
        51010.0,
    );
    let err = ledger.record_open(second).await.unwrap_err();
    assert!(matches!(err, LedgerError::LedgerConflict));
}

/// Closing a trade computes stats correctly and a double-close is rejected.
#[tokio::test]
async fn ledger_close_updates_stats_and_rejects_double_close() {
    let ledger = InMemoryTradeLedger::new();
    let user = UserId::from("bob");
    let trade = TradeRecord::open(
        user.clone(),
        "thor".into(),
        "ETH-PERPETUAL".into(),
        Broker::Deribit,
        Environment::Testnet,
        Side::Buy,
        3000.0,
        1.0,
        2950.0,
        3100.0,
    );
    let id = ledger.record_open(trade).await.unwrap();
    ledger.record_close(id, 3100.0, "take_profit".into(), 100.0).await.unwrap();

    let stats = ledger.trade_stats(&user).await.unwrap();
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.total_realized_pnl, 100.0);

    let err = ledger
        .record_close(id, 3100.0, "take_profit".into(), 100.0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyClosed(_)));
}

fn sample_key() -> InstanceKey {
    InstanceKey {
        user_id: UserId::from("carol"),
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    }
}

/// The daily trade counter resets exactly once a new calendar day is seen,
/// never silently accumulating across days.
#[tokio::test]
async fn repository_resets_daily_trade_count_on_new_day() {
    let repo = InMemoryStrategyRepository::new();
    let key = sample_key();
    let record = aurora_perp_core::repository::StrategyRecord::new(
        key.clone(),
        "razor".into(),
        serde_json::json!({}),
        true,
    );
    repo.upsert(record).await.unwrap();

    let today = chrono::Utc::now().date_naive();
    let count1 = repo.increment_daily_trade_count(&key, today).await.unwrap();
    let count2 = repo.increment_daily_trade_count(&key, today).await.unwrap();
    assert_eq!(count1, 1);
    assert_eq!(count2, 2);

    let tomorrow = today.succ_opt().unwrap();
    let count3 = repo.increment_daily_trade_count(&key, tomorrow).await.unwrap();
    assert_eq!(count3, 1, "count must reset when the stored day rolls over");
}

#[tokio::test]
async fn repository_increment_on_missing_record_is_not_found() {
    let repo = InMemoryStrategyRepository::new();
    let key = sample_key();
    let err = repo
        .increment_daily_trade_count(&key, chrono::Utc::now().date_naive())
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound(_)));
}

/// The registry refuses to build an unknown strategy kind rather than
/// silently defaulting to one of the known strategies.
#[test]
fn strategy_registry_rejects_unknown_kind() {
    let registry = StrategyRegistry::with_defaults();
    let err = registry.build("nonexistent", &serde_json::json!({})).unwrap_err();
    assert!(matches!(err, aurora_perp_core::error::ManagerError::UnknownStrategy(_)));
}

/// S6 — a resting order with no matching open ledger trade is swept by the
/// reconciliation pass, but a live broker *position* with no open trade is
/// only ever flagged, never force-closed.
#[tokio::test]
async fn reconciliation_sweeps_orphan_orders_but_never_force_closes_positions() {
    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());

    let user = UserId::from("dave");
    let key = InstanceKey {
        user_id: user.clone(),
        strategy_name: "razor-eth".into(),
        instrument: "ETH-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    repository
        .upsert(aurora_perp_core::repository::StrategyRecord::new(
            key.clone(),
            "razor".into(),
            serde_json::json!({}),
            true,
        ))
        .await
        .unwrap();

    let mock = Arc::new(MockBroker::new());
    mock.set_instrument("ETH-PERPETUAL", instrument_info());
    mock.push_price("ETH-PERPETUAL", 3000.0).await;
    // Orphan resting order: the ledger has no open trade for this key.
    let client: Arc<dyn BrokerClient> = mock.clone();
    client
        .place_order(
            aurora_perp_core::broker::OrderRequest::new(
                "ETH-PERPETUAL",
                Side::Sell,
                aurora_perp_core::broker::OrderType::Limit,
                1.0,
            )
            .with_label("stray_tp"),
        )
        .await
        .unwrap();
    // Orphan position: broker reports exposure with no matching ledger entry.
    mock.set_position("ETH-PERPETUAL", 2.0);

    broker_registry.register(user.clone(), Broker::Deribit, Environment::Testnet, mock.clone());

    let service = ReconciliationService::new(broker_registry, ledger, repository);
    let reports = service.reconcile_user(&user).await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.orphan_orders_swept, 1);
    assert!(report.orphan_position_detected);
    assert_eq!(mock.open_order_count("ETH-PERPETUAL"), 0);
    // Position must still be there — reconciliation never force-closes it.
    let positions = client.list_positions("ETH").await.unwrap();
    assert!(positions.iter().any(|p| p.instrument == "ETH-PERPETUAL" && p.size == 2.0));
}

/// C6 lifecycle: starting an instance with no registered broker for that
/// user is rejected rather than silently queued.
#[tokio::test]
async fn manager_start_rejects_when_broker_not_connected() {
    let broker_registry: Arc<dyn BrokerRegistry> = Arc::new(InMemoryBrokerRegistry::new());
    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    let manager = StrategyManager::new(broker_registry, strategy_registry, ledger, repository, EngineConfig::default());

    let err = manager
        .start_strategy(
            UserId::from("erin"),
            "razor-btc".into(),
            "BTC-PERPETUAL".into(),
            Broker::Deribit,
            Environment::Testnet,
            "razor".into(),
            serde_json::json!({}),
            true,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, aurora_perp_core::error::ManagerError::NotConnected));
}

/// C6 + C5: once a broker is connected, starting a strategy spawns a running
/// executor that `stop_strategy` can stop; status survives across both.
#[tokio::test]
async fn manager_starts_and_stops_strategy_lifecycle() {
    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    let mock = Arc::new(MockBroker::new());
    mock.set_instrument("BTC-PERPETUAL", instrument_info());
    let user = UserId::from("frank");
    broker_registry.register(user.clone(), Broker::Deribit, Environment::Testnet, mock.clone());

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    let manager = StrategyManager::new(
        broker_registry as Arc<dyn BrokerRegistry>,
        strategy_registry,
        ledger,
        repository.clone(),
        EngineConfig::default(),
    );

    manager
        .start_strategy(
            user.clone(),
            "razor-btc".into(),
            "BTC-PERPETUAL".into(),
            Broker::Deribit,
            Environment::Testnet,
            "razor".into(),
            serde_json::json!({}),
            true,
        )
        .await
        .unwrap();

    let key = InstanceKey {
        user_id: user.clone(),
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    assert!(manager.is_running(&key));

    let statuses = manager.status_for_user(&user).await.unwrap();
    assert_eq!(statuses.len(), 1);

    manager.stop_strategy(&key).await.unwrap();
    // The executor deregisters itself asynchronously from its own task once
    // it processes the Stop command; give it a beat to do so.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!manager.is_running(&key));
}

/// C6 `Start` rejects a second instance for a key that's already running.
#[tokio::test]
async fn manager_rejects_duplicate_start_for_same_key() {
    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    let mock = Arc::new(MockBroker::new());
    mock.set_instrument("BTC-PERPETUAL", instrument_info());
    let user = UserId::from("grace");
    broker_registry.register(user.clone(), Broker::Deribit, Environment::Testnet, mock.clone());

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    let manager = StrategyManager::new(
        broker_registry as Arc<dyn BrokerRegistry>,
        strategy_registry,
        ledger,
        repository,
        EngineConfig::default(),
    );

    let start = |m: Arc<StrategyManager>, u: UserId| async move {
        m.start_strategy(
            u,
            "razor-btc".into(),
            "BTC-PERPETUAL".into(),
            Broker::Deribit,
            Environment::Testnet,
            "razor".into(),
            serde_json::json!({}),
            true,
        )
        .await
    };

    let (first, second) = tokio::join!(
        start(manager.clone(), user.clone()),
        start(manager.clone(), user.clone())
    );
    let results = [first, second];
    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    let already_running_count = results
        .iter()
        .filter(|r| matches!(r, Err(aurora_perp_core::error::ManagerError::AlreadyRunning)))
        .count();
    assert_eq!(ok_count, 1, "exactly one concurrent start must win");
    assert_eq!(already_running_count, 1, "the other must see AlreadyRunning, not a duplicate registration");

    let key = InstanceKey {
        user_id: user,
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    assert!(manager.is_running(&key));
}

/// S3 — crash and resume: a record left `status=active, auto_reconnect=true`
/// by a prior process is picked back up by `initialize` without the caller
/// having to call `start_strategy` again.
#[tokio::test]
async fn manager_initialize_resumes_active_auto_reconnect_records() {
    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    let mock = Arc::new(MockBroker::new());
    mock.set_instrument("BTC-PERPETUAL", instrument_info());
    let user = UserId::from("heidi");
    broker_registry.register(user.clone(), Broker::Deribit, Environment::Testnet, mock.clone());

    let key = InstanceKey {
        user_id: user.clone(),
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    repository
        .upsert(aurora_perp_core::repository::StrategyRecord::new(
            key.clone(),
            "razor".into(),
            serde_json::json!({}),
            true,
        ))
        .await
        .unwrap();

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let manager = StrategyManager::new(
        broker_registry as Arc<dyn BrokerRegistry>,
        strategy_registry,
        ledger,
        repository,
        EngineConfig::default(),
    );

    let resumed = manager.initialize().await.unwrap();
    assert_eq!(resumed, 1);
    assert!(manager.is_running(&key));
}

/// S4 — crash and manual-stop respected: a record left `status=stopped` is
/// never picked up by `initialize`, even though the rest of its state is
/// otherwise identical to a resumable record.
#[tokio::test]
async fn manager_initialize_skips_manually_stopped_records() {
    let broker_registry = Arc::new(InMemoryBrokerRegistry::new());
    let mock = Arc::new(MockBroker::new());
    mock.set_instrument("BTC-PERPETUAL", instrument_info());
    let user = UserId::from("ivan");
    broker_registry.register(user.clone(), Broker::Deribit, Environment::Testnet, mock.clone());

    let key = InstanceKey {
        user_id: user.clone(),
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    repository
        .upsert(aurora_perp_core::repository::StrategyRecord::new(
            key.clone(),
            "razor".into(),
            serde_json::json!({}),
            true,
        ))
        .await
        .unwrap();
    repository.mark_stopped(&key).await.unwrap();

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let manager = StrategyManager::new(
        broker_registry as Arc<dyn BrokerRegistry>,
        strategy_registry,
        ledger,
        repository,
        EngineConfig::default(),
    );

    let resumed = manager.initialize().await.unwrap();
    assert_eq!(resumed, 0);
    assert!(!manager.is_running(&key));
}

/// S5 — user disconnected at boot: a resumable record whose broker was never
/// reconnected fails to spawn and is marked `errored` rather than left
/// silently `active` with no running executor behind it.
#[tokio::test]
async fn manager_initialize_errors_resumable_record_with_no_broker_connection() {
    let broker_registry: Arc<dyn BrokerRegistry> = Arc::new(InMemoryBrokerRegistry::new());
    let user = UserId::from("judy");

    let key = InstanceKey {
        user_id: user.clone(),
        strategy_name: "razor-btc".into(),
        instrument: "BTC-PERPETUAL".into(),
        broker: Broker::Deribit,
        environment: Environment::Testnet,
    };
    let repository: Arc<dyn StrategyRepository> = Arc::new(InMemoryStrategyRepository::new());
    repository
        .upsert(aurora_perp_core::repository::StrategyRecord::new(
            key.clone(),
            "razor".into(),
            serde_json::json!({}),
            true,
        ))
        .await
        .unwrap();

    let strategy_registry = Arc::new(StrategyRegistry::with_defaults());
    let ledger: Arc<dyn TradeLedger> = Arc::new(InMemoryTradeLedger::new());
    let manager = StrategyManager::new(
        broker_registry,
        strategy_registry,
        ledger,
        repository.clone(),
        EngineConfig::default(),
    );

    let resumed = manager.initialize().await.unwrap();
    assert_eq!(resumed, 0);
    assert!(!manager.is_running(&key));
    let record = repository.get(&key).await.unwrap().unwrap();
    assert!(matches!(
        record.status,
        aurora_perp_core::repository::StrategyStatus::Errored
    ));
}
