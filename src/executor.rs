// =============================================================================
// Strategy Executor
// =============================================================================
//
// One executor per running strategy instance, holding at most a single open
// position at a time. All input — ticker updates, internal timer ticks, stop
// requests — arrives over one bounded mpsc channel and is handled strictly
// in order, so there is never a race between "evaluate a new entry" and
// "notice the current position closed". A single serialized per-executor
// channel replaces ad-hoc shared-state polling loops over a fixed-interval
// sweep across a shared map.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::analysis::PriceHistory;
use crate::bracket::{BracketOrchestrator, BracketRequest, BracketResult};
use crate::broker::{BrokerClient, OrderType, TickerUpdate};
use crate::ledger::{TradeLedger, TradeRecord};
use crate::repository::StrategyRepository;
use crate::strategy::Strategy;
use crate::supervisor::Supervisor;
use crate::types::{InstanceKey, Side};

/// Inbound message to a running executor.
pub enum ExecutorCommand {
    Tick(TickerUpdate),
    /// Fired on a fixed interval even without a ticker update, so a closed
    /// position is noticed promptly even on a quiet instrument.
    InternalTimer,
    Stop,
}

#[derive(Debug, Clone)]
enum ExecutorState {
    Idle,
    Cooldown { until: Instant },
    InPosition {
        trade_id: Uuid,
        side: Side,
        amount: f64,
        entry_price: f64,
        stop_loss_order_id: String,
        take_profit_order_id: String,
        stop_loss_price: f64,
        take_profit_price: f64,
    },
}

pub struct ExecutorConfig {
    pub cooldown: Duration,
    pub max_daily_trades: u32,
    pub timer_interval: Duration,
    /// Bounded timeout applied to each bracket leg placement.
    pub bracket_timeout: Duration,
}

pub struct StrategyExecutor {
    key: InstanceKey,
    broker: Arc<dyn BrokerClient>,
    strategy: Arc<dyn Strategy>,
    ledger: Arc<dyn TradeLedger>,
    repository: Arc<dyn StrategyRepository>,
    supervisor: Arc<dyn Supervisor>,
    config: ExecutorConfig,
    history: PriceHistory,
    state: ExecutorState,
    cmd_rx: mpsc::Receiver<ExecutorCommand>,
}

impl StrategyExecutor {
    /// Spawns the ticker subscription and the timer tick source, and returns
    /// the executor plus the sender the manager uses to deliver `Stop`.
    pub async fn spawn(
        key: InstanceKey,
        broker: Arc<dyn BrokerClient>,
        strategy: Arc<dyn Strategy>,
        ledger: Arc<dyn TradeLedger>,
        repository: Arc<dyn StrategyRepository>,
        supervisor: Arc<dyn Supervisor>,
        config: ExecutorConfig,
    ) -> Result<(tokio::task::JoinHandle<()>, mpsc::Sender<ExecutorCommand>), crate::error::BrokerError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let (ticker_tx, mut ticker_rx) = mpsc::channel(256);
        broker.subscribe_ticker(&key.instrument, ticker_tx).await?;
        let forward_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(update) = ticker_rx.recv().await {
                if forward_tx.send(ExecutorCommand::Tick(update)).await.is_err() {
                    break;
                }
            }
        });

        let timer_tx = cmd_tx.clone();
        let timer_interval = config.timer_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timer_interval);
            loop {
                interval.tick().await;
                if timer_tx.send(ExecutorCommand::InternalTimer).await.is_err() {
                    break;
                }
            }
        });

        let executor = Self {
            key,
            broker,
            strategy,
            ledger,
            repository,
            supervisor,
            config,
            history: PriceHistory::new(),
            state: ExecutorState::Idle,
            cmd_rx,
        };

        let handle = tokio::spawn(executor.run());
        Ok((handle, cmd_tx))
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn run(mut self) {
        info!("executor started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ExecutorCommand::Tick(update) => {
                    self.history.push(update.price);
                    self.on_tick(update.price).await;
                }
                ExecutorCommand::InternalTimer => {
                    let _ = self.repository.update_heartbeat(&self.key, chrono::Utc::now()).await;
                    if let Some(price) = self.history.last() {
                        self.check_position_and_resume(price).await;
                    }
                }
                ExecutorCommand::Stop => {
                    info!("executor received stop, exiting without touching resting orders");
                    let _ = self.repository.mark_stopped(&self.key).await;
                    break;
                }
            }
        }
        self.supervisor.on_executor_finished(&self.key);
        info!("executor stopped");
    }

    async fn on_tick(&mut self, price: f64) {
        match &self.state {
            ExecutorState::Idle => self.maybe_enter(price).await,
            ExecutorState::Cooldown { until } => {
                if Instant::now() >= *until {
                    self.state = ExecutorState::Idle;
                    self.maybe_enter(price).await;
                }
            }
            ExecutorState::InPosition { .. } => self.check_position_and_resume(price).await,
        }
    }

    async fn maybe_enter(&mut self, price: f64) {
        if self.history.len() < self.strategy.min_history() {
            return;
        }
        if self.daily_trade_count_exceeded().await {
            return;
        }
        let Some(signal) = self.strategy.evaluate(&self.history.as_slice()) else {
            return;
        };

        if self.has_orphan_position().await {
            warn!("orphan position already open for this instrument, aborting entry");
            return;
        }

        let direction = signal.side.direction();
        let stop_loss_price = price * (1.0 - direction * signal.stop_loss_pct);
        let take_profit_price = price * (1.0 + direction * signal.take_profit_pct);
        let amount = self.strategy.trade_size() / price;

        let label_prefix = format!("{}-{}", self.key.strategy_name, Uuid::new_v4());
        let request = BracketRequest {
            instrument: self.key.instrument.clone(),
            side: signal.side,
            amount,
            entry_type: OrderType::Market,
            entry_price: None,
            stop_loss_price,
            take_profit_price,
            reference_price: price,
            label_prefix,
        };

        match BracketOrchestrator::place_bracket(&self.broker, request, self.config.bracket_timeout).await {
            Ok(result) => self.on_entered(signal.side, result, signal.reason).await,
            Err(e) => {
                warn!(error = %e, "bracket placement failed, entering cooldown");
                self.enter_cooldown().await;
            }
        }
    }

    /// Pre-trade defensive check: a nonzero position already resting on the
    /// broker for this instrument means some other process (or a missed
    /// close) already has exposure here, so a fresh entry must not stack on
    /// top of it.
    async fn has_orphan_position(&self) -> bool {
        let currency = self.key.instrument.split('-').next().unwrap_or(&self.key.instrument);
        match self.broker.list_positions(currency).await {
            Ok(positions) => positions
                .iter()
                .any(|p| p.instrument == self.key.instrument && !p.is_flat()),
            Err(e) => {
                warn!(error = %e, "failed to list positions for pre-trade orphan check, allowing entry");
                false
            }
        }
    }

    /// A strategy must not enter once its persisted daily trade count has
    /// reached the configured cap for today. Reads the repository rather
    /// than keeping a local counter so the cap is honored consistently with
    /// the count `on_entered` increments and survives a restart mid-day.
    async fn daily_trade_count_exceeded(&self) -> bool {
        let today = chrono::Utc::now().date_naive();
        match self.repository.get(&self.key).await {
            Ok(Some(record)) => {
                let count = if record.last_reset_date == today {
                    record.daily_trade_count
                } else {
                    0
                };
                count >= self.config.max_daily_trades
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to read daily trade count, allowing entry");
                false
            }
        }
    }

    async fn on_entered(&mut self, side: Side, result: BracketResult, reason: String) {
        let trade = TradeRecord::open(
            self.key.user_id.clone(),
            self.key.strategy_name.clone(),
            self.key.instrument.clone(),
            self.key.broker,
            self.key.environment,
            side,
            result.entry_fill_price,
            result.amount,
            result.stop_loss.filled_price.unwrap_or_default(),
            result.take_profit.filled_price.unwrap_or_default(),
        );
        let trade_id = match self.ledger.record_open(trade).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to record opened trade in ledger");
                Uuid::new_v4()
            }
        };

        let today = chrono::Utc::now().date_naive();
        let _ = self.repository.increment_daily_trade_count(&self.key, today).await;

        info!(reason, trade_id = %trade_id, "entered position");

        self.state = ExecutorState::InPosition {
            trade_id,
            side,
            amount: result.amount,
            entry_price: result.entry_fill_price,
            stop_loss_order_id: result.stop_loss.order_id,
            take_profit_order_id: result.take_profit.order_id,
            stop_loss_price: result.stop_loss.filled_price.unwrap_or_default(),
            take_profit_price: result.take_profit.filled_price.unwrap_or_default(),
        };
    }

    /// Checks whether the broker still reports an open position for this
    /// instrument; if it's gone, the protective bracket resolved (SL or TP
    /// filled) and the executor reconciles the ledger and returns to idle.
    /// This is a defense-in-depth position-based check independent of fill
    /// notifications, since a reduce-only leg filling doesn't push an event
    /// back through this executor's channel.
    async fn check_position_and_resume(&mut self, last_price: f64) {
        let ExecutorState::InPosition {
            trade_id,
            side,
            amount,
            entry_price,
            stop_loss_order_id: _,
            take_profit_order_id: _,
            stop_loss_price,
            take_profit_price,
        } = self.state.clone()
        else {
            return;
        };

        let currency = self.key.instrument.split('-').next().unwrap_or(&self.key.instrument);
        let positions = match self.broker.list_positions(currency).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to list positions during resume check");
                return;
            }
        };

        let still_open = positions
            .iter()
            .any(|p| p.instrument == self.key.instrument && !p.is_flat());
        if still_open {
            return;
        }

        // Belt-and-braces cleanup: whichever leg didn't trigger the close
        // (or both, if the close came from outside the bracket entirely)
        // must not keep resting against a flat position.
        if let Err(e) = self.broker.cancel_all_for_instrument(&self.key.instrument).await {
            warn!(error = %e, "failed to cancel resting orders after position closed");
        }

        let dist_sl = (last_price - stop_loss_price).abs();
        let dist_tp = (last_price - take_profit_price).abs();
        let close_reason = if dist_sl < dist_tp {
            "stop_loss"
        } else if dist_tp < dist_sl {
            "take_profit"
        } else {
            "manual"
        };
        let direction = side.direction();
        let realized_pnl = (last_price - entry_price) * direction * amount;

        if let Err(e) = self
            .ledger
            .record_close(trade_id, last_price, close_reason.to_string(), realized_pnl)
            .await
        {
            warn!(error = %e, "failed to record trade close in ledger");
        }

        info!(trade_id = %trade_id, close_reason, realized_pnl, "position closed, resuming");
        self.enter_cooldown().await;
    }

    async fn enter_cooldown(&mut self) {
        let until = Instant::now() + self.config.cooldown;
        let wall_clock_until = chrono::Utc::now() + chrono::Duration::from_std(self.config.cooldown).unwrap_or_default();
        let _ = self
            .repository
            .set_cooldown(&self.key, Some(wall_clock_until))
            .await;
        self.state = ExecutorState::Cooldown { until };
    }
}
