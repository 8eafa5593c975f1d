//! The tick loop: context assembly, decision execution and post-trade
//! bookkeeping.
//!
//! One logical thread drives everything. Within a tick, market-data fetches
//! fan out; decision execution is strictly serialized in priority order.
//! External failures degrade (cached data, skipped symbols) and never abort
//! the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::constraints::TradingConstraints;
use crate::decision_log::{AccountSnapshot, DecisionLogger, DecisionRecord, ExecutedAction};
use crate::order_manager::{ManagedOrder, OrderManager};
use crate::reconcile::OrderReconciler;
use crate::recovery;
use crate::universe::CandidateUniverse;
use perppilot_agents::llm::LlmClient;
use perppilot_agents::orchestrator::{
    DecisionOrchestrator, OrchestratorConfig, TickContext,
};
use perppilot_core::config::AppConfig;
use perppilot_core::constants::{MAX_MARGIN_UTILIZATION_PCT, MIN_OPEN_INTEREST_NOTIONAL_USDT};
use perppilot_core::types::{
    AccountInfo, CandidateSymbol, Decision, DecisionAction, Direction, PositionInfo, PositionSide,
};
use perppilot_market_data::{MarketDataService, MarketSnapshot};
use perppilot_memory::{MemoryManager, TradeAction, TradeEntry, TradeResult};
use perppilot_tracker::{PredictionTracker, PricePathProvider};

/// Unknown positions found at startup are assumed this old so the min-hold
/// protection cannot misread them as freshly opened.
const RESTART_SEED_MINUTES: i64 = 60;
/// A close we initiated suppresses disappeared-position attribution for
/// this long.
const MANUAL_CLOSE_WINDOW_MINUTES: i64 = 2;
/// Cycles of history used for the Sharpe estimate.
const PERFORMANCE_WINDOW_CYCLES: usize = 100;

/// Snapshot source seam (the live implementation is the market-data
/// service; tests plug in canned snapshots).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> anyhow::Result<MarketSnapshot>;
}

#[async_trait]
impl SnapshotSource for MarketDataService {
    async fn snapshot(&self, symbol: &str) -> anyhow::Result<MarketSnapshot> {
        Ok(self.get(symbol).await?)
    }
}

/// Everything the auto-trader is wired with.
pub struct AutoTraderDeps {
    pub config: AppConfig,
    pub trader: Arc<dyn perppilot_exchange::Trader>,
    pub llm: Arc<dyn LlmClient>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub universe: Arc<dyn CandidateUniverse>,
    /// Price-path provider for tracker evaluation; absent in offline tests.
    pub price_paths: Option<Arc<dyn PricePathProvider>>,
}

pub struct AutoTrader {
    config: AppConfig,
    trader: Arc<dyn perppilot_exchange::Trader>,
    snapshots: Arc<dyn SnapshotSource>,
    universe: Arc<dyn CandidateUniverse>,
    price_paths: Option<Arc<dyn PricePathProvider>>,

    orchestrator: DecisionOrchestrator,
    tracker: Arc<PredictionTracker>,
    memory: MemoryManager,
    constraints: TradingConstraints,
    orders: OrderManager,
    logger: DecisionLogger,

    cycle: u64,
    daily_pnl: f64,
    day_number: i32,
    stop_until: Option<DateTime<Utc>>,
    last_position_snapshot: HashMap<String, PositionInfo>,
    manual_close_tracker: HashMap<String, DateTime<Utc>>,
}

impl AutoTrader {
    /// Wires the trader and runs startup recovery: cycle numbering, order
    /// reaping and missing-stop reconciliation.
    pub async fn new(deps: AutoTraderDeps) -> anyhow::Result<Self> {
        let AutoTraderDeps { config, trader, llm, snapshots, universe, price_paths } = deps;

        let data_dir = std::path::PathBuf::from(&config.trader.data_dir);
        let tracker = Arc::new(PredictionTracker::new(
            data_dir.join("prediction_records").join(&config.trader.id),
        )?);
        let memory = MemoryManager::open(data_dir.join("trader_memory"), &config.trader.id)?;
        let orders = OrderManager::open(data_dir.join("limit_orders").join(&config.trader.id))?;
        let logger = DecisionLogger::open(data_dir.join("decision_logs").join(&config.trader.id))?;
        let constraints = TradingConstraints::new(config.constraints.clone());

        let cycle = logger.recover_last_cycle();
        if cycle > 0 {
            info!(cycle, "resuming cycle numbering from the decision log");
        }

        let reaped = recovery::reap_terminal_orders(trader.as_ref(), &orders).await;
        if reaped > 0 {
            info!(reaped, "terminal limit orders reaped at startup");
        }
        if let Err(err) = recovery::recover_missing_stop_loss(trader.as_ref(), &orders).await {
            warn!(error = %err, "missing-stop recovery failed; continuing");
        }

        let orchestrator = DecisionOrchestrator::new(
            llm,
            Arc::clone(&tracker),
            config.trader.btc_eth_leverage,
            config.trader.altcoin_leverage,
            OrchestratorConfig {
                gate_policy: config.gate.policy,
                max_positions: config.constraints.max_positions,
                use_limit_orders: config.trader.use_limit_orders,
            },
        );

        Ok(Self {
            config,
            trader,
            snapshots,
            universe,
            price_paths,
            orchestrator,
            tracker,
            memory,
            constraints,
            orders,
            logger,
            cycle,
            daily_pnl: 0.0,
            day_number: Utc::now().date_naive().num_days_from_ce(),
            stop_until: None,
            last_position_snapshot: HashMap::new(),
            manual_close_tracker: HashMap::new(),
        })
    }

    /// Runs the tick loop until the task is aborted. A tick that overruns
    /// the interval delays the next one; ticks never overlap.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            trader_id = %self.config.trader.id,
            interval_secs = self.config.trader.scan_interval_secs,
            "auto-trader started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.trader.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(err) = self.run_cycle().await {
                error!(error = %err, "cycle failed");
            }
        }
    }

    /// One full tick.
    pub async fn run_cycle(&mut self) -> anyhow::Result<()> {
        self.cycle += 1;
        let now = Utc::now();
        info!(cycle = self.cycle, "tick start");

        let mut record = DecisionRecord {
            cycle_number: self.cycle,
            timestamp: Some(now),
            success: true,
            ..DecisionRecord::default()
        };

        // Circuit breaker pause.
        if let Some(until) = self.stop_until {
            if now < until {
                let remaining = (until - now).num_minutes();
                warn!(remaining_minutes = remaining, "trading paused by circuit breaker");
                record.success = false;
                record.error_message = format!("paused, {remaining} min remaining");
                self.logger.log(record)?;
                return Ok(());
            }
            self.stop_until = None;
        }

        // Daily PnL reset on the calendar day boundary.
        let today = now.date_naive().num_days_from_ce();
        if today != self.day_number {
            self.day_number = today;
            self.daily_pnl = 0.0;
            info!("daily pnl reset");
        }

        // Evaluate matured predictions before building the new context.
        if let Some(paths) = &self.price_paths {
            let evaluated = self.tracker.evaluate_pending(paths.as_ref()).await;
            if evaluated > 0 {
                info!(evaluated, "prediction records evaluated");
            }
        }

        let ctx = match self.build_context().await {
            Ok(ctx) => ctx,
            Err(err) => {
                record.success = false;
                record.error_message = format!("context assembly failed: {err}");
                self.logger.log(record)?;
                return Err(err);
            }
        };
        record.account = AccountSnapshot {
            total_equity: ctx.account.total_equity,
            available_balance: ctx.account.available_balance,
            unrealized_pnl: 0.0,
            position_count: ctx.account.position_count,
            margin_used_pct: ctx.account.margin_used_pct,
        };
        record.positions = ctx.positions.clone();
        record.candidate_symbols = ctx.candidates.iter().map(|c| c.symbol.clone()).collect();

        // Safety brakes.
        if let Some(message) = self.check_circuit_breakers(&ctx.account) {
            record.success = false;
            record.error_message = message;
            self.logger.log(record)?;
            return Ok(());
        }

        // Attribute positions that vanished between ticks, then reconcile
        // resting limit orders.
        self.detect_disappeared_positions(&ctx.positions, ctx.account.total_equity);
        let reconciler = OrderReconciler {
            trader: self.trader.as_ref(),
            orders: &self.orders,
            constraints: &self.constraints,
            single_position_per_side: self.config.constraints.single_position_per_side,
        };
        for event in reconciler.run().await {
            record.execution_log.push(format!("reconcile: {event:?}"));
        }

        // The decision pipeline.
        let decision = match self.orchestrator.decide(&ctx).await {
            Ok(decision) => decision,
            Err(err) => {
                record.success = false;
                record.error_message = format!("pipeline failed: {err}");
                self.logger.log(record)?;
                return Err(err.into());
            }
        };
        record.cot_trace = decision.cot_trace.clone();
        record.decisions = decision.decisions.clone();

        // Execute in priority order (already sorted: closes before opens).
        for d in &decision.decisions {
            let mut action = ExecutedAction {
                action: format!("{:?}", d.action),
                symbol: d.symbol.clone(),
                success: false,
                error: String::new(),
                timestamp: Utc::now(),
            };

            match self.execute_decision(d, &ctx).await {
                Ok(()) => {
                    action.success = true;
                    record
                        .execution_log
                        .push(format!("ok: {} {:?}", d.symbol, d.action));
                }
                Err(err) => {
                    warn!(symbol = %d.symbol, action = ?d.action, error = %err, "decision failed");
                    action.error = err.to_string();
                    record
                        .execution_log
                        .push(format!("failed: {} {:?}: {err}", d.symbol, d.action));
                }
            }
            record.executed.push(action);
        }

        self.logger.log(record)?;
        Ok(())
    }

    /// Assembles the tick context: account, positions with open times,
    /// candidate universe and parallel snapshot fetches.
    async fn build_context(&mut self) -> anyhow::Result<TickContext> {
        let balance = self.trader.balance().await?;
        let mut positions = self.trader.positions().await?;

        let total_wallet = balance.total_wallet_balance.to_f64().unwrap_or(0.0);
        let unrealized = balance.total_unrealized_profit.to_f64().unwrap_or(0.0);
        let available = balance.available_balance.to_f64().unwrap_or(0.0);
        let total_equity = total_wallet + unrealized;

        // Merge authoritative open times; seed unknown positions
        // conservatively so restart-recovered positions are not treated as
        // minutes old.
        for position in &mut positions {
            match self.constraints.position_open_time(&position.symbol, position.side) {
                Some(open_time) => position.open_time = Some(open_time),
                None => {
                    let seeded = position
                        .open_time
                        .unwrap_or_else(|| Utc::now() - chrono::Duration::minutes(RESTART_SEED_MINUTES));
                    self.constraints.seed_open_time(&position.symbol, position.side, seeded);
                    position.open_time = Some(seeded);
                }
            }
        }

        let margin_used: f64 = positions.iter().map(PositionInfo::margin_used_f64).sum();

        let initial = self.config.trader.initial_balance;
        let total_pnl = total_equity - initial;
        let total_pnl_pct = if initial > 0.0 { total_pnl / initial * 100.0 } else { 0.0 };

        let account = AccountInfo {
            total_equity,
            available_balance: available,
            total_pnl,
            total_pnl_pct,
            margin_used,
            margin_used_pct: if total_equity > 0.0 { margin_used / total_equity * 100.0 } else { 0.0 },
            position_count: positions.len(),
        };

        // Universe: top-N candidates plus anything held.
        let mut candidates = self
            .universe
            .candidates(self.config.trader.candidate_limit)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "candidate universe unavailable");
                Vec::new()
            });
        let mut seen: HashSet<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
        for position in &positions {
            if seen.insert(position.symbol.clone()) {
                candidates.push(CandidateSymbol {
                    symbol: position.symbol.clone(),
                    sources: vec!["held".to_string()],
                });
            }
        }
        if !seen.contains("BTCUSDT") {
            candidates.push(CandidateSymbol {
                symbol: "BTCUSDT".to_string(),
                sources: vec!["reference".to_string()],
            });
        }

        // Parallel snapshot fetches into a shared map; individual failures
        // drop the symbol for this tick.
        let mut snapshots: HashMap<String, MarketSnapshot> = HashMap::new();
        let mut fetches: JoinSet<(String, anyhow::Result<MarketSnapshot>)> = JoinSet::new();
        for candidate in &candidates {
            let source = Arc::clone(&self.snapshots);
            let symbol = candidate.symbol.clone();
            fetches.spawn(async move {
                let result = source.snapshot(&symbol).await;
                (symbol, result)
            });
        }
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((symbol, Ok(snapshot))) => {
                    snapshots.insert(symbol, snapshot);
                }
                Ok((symbol, Err(err))) => {
                    warn!(%symbol, error = %err, "snapshot fetch failed, skipping symbol");
                }
                Err(err) => warn!(error = %err, "snapshot task panicked"),
            }
        }

        // Liquidity floor: thin candidates are dropped, held symbols stay.
        let held: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        candidates.retain(|c| {
            if held.contains(c.symbol.as_str()) {
                return true;
            }
            match snapshots.get(&c.symbol) {
                Some(snap) => {
                    let notional = snap.open_interest_notional();
                    if notional > 0.0 && notional < MIN_OPEN_INTEREST_NOTIONAL_USDT {
                        info!(symbol = %c.symbol, notional, "candidate below the liquidity floor");
                        false
                    } else {
                        true
                    }
                }
                None => false,
            }
        });

        let sharpe = self
            .logger
            .analyze_performance(PERFORMANCE_WINDOW_CYCLES)
            .sharpe_ratio;

        Ok(TickContext {
            account,
            positions,
            candidates,
            snapshots,
            memory_prompt: self.memory.context_prompt(),
            sharpe_ratio: sharpe,
        })
    }

    /// Daily-loss and drawdown brakes; both pause the loop for the
    /// configured window.
    fn check_circuit_breakers(&mut self, account: &AccountInfo) -> Option<String> {
        let initial = self.config.trader.initial_balance;
        if initial <= 0.0 {
            return None;
        }

        let daily_pct = self.daily_pnl / initial * 100.0;
        if self.config.trader.max_daily_loss_pct > 0.0
            && daily_pct < -self.config.trader.max_daily_loss_pct
        {
            let until = Utc::now()
                + chrono::Duration::minutes(self.config.trader.stop_trading_minutes as i64);
            self.stop_until = Some(until);
            error!(daily_pct, "daily loss limit tripped, pausing");
            return Some(format!("daily loss {daily_pct:.2}% tripped the breaker"));
        }

        let drawdown_pct = if account.total_equity < initial {
            (initial - account.total_equity) / initial * 100.0
        } else {
            0.0
        };
        if self.config.trader.max_drawdown_pct > 0.0
            && drawdown_pct > self.config.trader.max_drawdown_pct
        {
            let until = Utc::now()
                + chrono::Duration::minutes(self.config.trader.stop_trading_minutes as i64);
            self.stop_until = Some(until);
            error!(drawdown_pct, "drawdown limit tripped, pausing");
            return Some(format!("drawdown {drawdown_pct:.2}% tripped the breaker"));
        }

        None
    }

    /// Positions present last tick and absent now were closed by the venue
    /// (stop, take-profit or liquidation) unless we closed them ourselves
    /// moments ago; record the outcome so the memory learns from unintended
    /// exits.
    fn detect_disappeared_positions(&mut self, current: &[PositionInfo], total_equity: f64) {
        let now = Utc::now();
        let current_keys: HashSet<String> =
            current.iter().map(|p| position_key(&p.symbol, p.side)).collect();

        let previous = std::mem::take(&mut self.last_position_snapshot);
        for (key, last) in &previous {
            if current_keys.contains(key) {
                continue;
            }

            if let Some(closed_at) = self.manual_close_tracker.get(key) {
                if now - *closed_at < chrono::Duration::minutes(MANUAL_CLOSE_WINDOW_MINUTES) {
                    info!(symbol = %last.symbol, "position closed by our own decision");
                    continue;
                }
            }

            let trigger = if last.unrealized_pnl_pct > 0.0 { "take-profit" } else { "stop-loss" };
            warn!(
                symbol = %last.symbol,
                side = last.side.as_str(),
                pnl_pct = last.unrealized_pnl_pct,
                trigger,
                "position disappeared between ticks"
            );

            let hold_minutes = last.held_minutes(now).unwrap_or(0);
            let entry = TradeEntry {
                trade_id: 0,
                cycle: self.cycle,
                timestamp: now,
                market_regime: String::new(),
                action: TradeAction::Close,
                symbol: last.symbol.clone(),
                side: last.side,
                signals: vec![format!("{trigger} auto-triggered")],
                reasoning: format!("{trigger} fired at the venue without a close decision"),
                predicted_direction: None,
                predicted_prob: 0.0,
                predicted_move: 0.0,
                entry_price: last.entry_price.to_f64().unwrap_or(0.0),
                exit_price: last.mark_price.to_f64().unwrap_or(0.0),
                position_pct: if total_equity > 0.0 {
                    last.margin_used_f64() / total_equity * 100.0
                } else {
                    0.0
                },
                leverage: last.leverage,
                is_limit_order: false,
                limit_price: 0.0,
                current_price: 0.0,
                hold_minutes,
                return_pct: last.unrealized_pnl_pct,
                result: Some(TradeResult::from_return_pct(last.unrealized_pnl_pct)),
            };
            if let Err(err) = self.memory.add_trade(entry) {
                warn!(error = %err, "failed to record venue-side exit");
            }
            self.constraints.record_close_position(&last.symbol, last.side);
        }

        self.last_position_snapshot = current
            .iter()
            .map(|p| (position_key(&p.symbol, p.side), p.clone()))
            .collect();

        self.manual_close_tracker
            .retain(|_, t| now - *t < chrono::Duration::minutes(10));
    }

    async fn execute_decision(&mut self, d: &Decision, ctx: &TickContext) -> anyhow::Result<()> {
        match d.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => self.execute_open(d, ctx).await,
            DecisionAction::CloseLong | DecisionAction::CloseShort => {
                self.execute_close(d, ctx).await
            }
            DecisionAction::Hold | DecisionAction::Wait => Ok(()),
        }
    }

    async fn execute_open(&mut self, d: &Decision, ctx: &TickContext) -> anyhow::Result<()> {
        let side = d
            .action
            .side()
            .ok_or_else(|| anyhow::anyhow!("{:?} carries no side", d.action))?;
        let positions = self.trader.positions().await?;

        self.constraints.can_open_position(&d.symbol, positions.len())?;

        if positions.iter().any(|p| p.symbol == d.symbol && p.side == side) {
            anyhow::bail!(
                "{} already has a {} position; refusing to stack",
                d.symbol,
                side.as_str()
            );
        }
        if self.config.constraints.single_position_per_side
            && positions.iter().any(|p| p.symbol != d.symbol && p.side == side)
        {
            anyhow::bail!("single-position-per-side rule blocks a second {}", side.as_str());
        }

        // Margin feasibility: the projected account-wide utilization stays
        // under the hard cap and the new margin fits the free balance.
        let margin_used: f64 = positions.iter().map(PositionInfo::margin_used_f64).sum();
        let required_margin = d.position_size_usd / f64::from(d.leverage.max(1));
        let projected_pct = if ctx.account.total_equity > 0.0 {
            (margin_used + required_margin) / ctx.account.total_equity * 100.0
        } else {
            100.0
        };
        if projected_pct > MAX_MARGIN_UTILIZATION_PCT {
            anyhow::bail!(
                "projected margin utilization {projected_pct:.1}% exceeds {MAX_MARGIN_UTILIZATION_PCT:.0}%"
            );
        }
        if required_margin > ctx.account.available_balance {
            anyhow::bail!(
                "required margin {required_margin:.2} exceeds available {:.2}",
                ctx.account.available_balance
            );
        }

        if d.is_limit_order && d.limit_price > 0.0 {
            return self.execute_open_limit(d, side).await;
        }

        let price = self.trader.market_price(&d.symbol).await?;
        let quantity = Decimal::try_from(d.position_size_usd)
            .ok()
            .and_then(|size| (price > Decimal::ZERO).then(|| size / price))
            .ok_or_else(|| anyhow::anyhow!("cannot derive quantity at price {price}"))?;

        let ack = match side {
            PositionSide::Long => self.trader.open_long(&d.symbol, quantity, d.leverage).await?,
            PositionSide::Short => self.trader.open_short(&d.symbol, quantity, d.leverage).await?,
        };
        info!(symbol = %d.symbol, order_id = ack.order_id, side = side.as_str(), "position opened");

        self.constraints.record_open_position(&d.symbol, side);

        let stop = Decimal::try_from(d.stop_loss).unwrap_or_default();
        let tp = Decimal::try_from(d.take_profit).unwrap_or_default();
        if let Err(err) = self.trader.set_stop_loss(&d.symbol, side, quantity, stop).await {
            error!(
                symbol = %d.symbol,
                error = %err,
                unprotected_position = true,
                "stop-loss placement failed after open"
            );
        }
        if let Err(err) = self.trader.set_take_profit(&d.symbol, side, quantity, tp).await {
            warn!(symbol = %d.symbol, error = %err, "take-profit placement failed");
        }

        let entry = self.trade_entry_for_open(d, side, ctx);
        if let Err(err) = self.memory.add_trade(entry) {
            warn!(error = %err, "failed to record open in memory");
        }
        Ok(())
    }

    async fn execute_open_limit(&mut self, d: &Decision, side: PositionSide) -> anyhow::Result<()> {
        let direction = match side {
            PositionSide::Long => Direction::Up,
            PositionSide::Short => Direction::Down,
        };

        if self.orders.has_order(&d.symbol) {
            match self.orders.should_update_price(&d.symbol, d.limit_price, direction) {
                None => {
                    info!(symbol = %d.symbol, "keeping the resting limit order");
                    return Ok(());
                }
                Some(reason) => {
                    info!(symbol = %d.symbol, reason, "replacing the resting limit order");
                    if let Some(existing) = self.orders.get(&d.symbol) {
                        // Cancel first; if the cancel fails the new order is
                        // still attempted (the venue rejects true duplicates).
                        if let Err(err) =
                            self.trader.cancel_order(&d.symbol, existing.order_id).await
                        {
                            warn!(symbol = %d.symbol, error = %err, "cancel of old order failed");
                        }
                    }
                    let _ = self.orders.remove(&d.symbol);
                }
            }
        }

        let price = Decimal::try_from(d.limit_price)
            .map_err(|_| anyhow::anyhow!("limit price {} not representable", d.limit_price))?;
        let quantity = Decimal::try_from(d.position_size_usd / d.limit_price)
            .map_err(|_| anyhow::anyhow!("quantity not representable"))?;

        let ack = self
            .trader
            .place_limit_order(&d.symbol, side, price, quantity, d.leverage)
            .await?;
        info!(symbol = %d.symbol, order_id = ack.order_id, price = d.limit_price, "limit order placed");

        self.orders.add(ManagedOrder {
            order_id: ack.order_id,
            symbol: d.symbol.clone(),
            side,
            price: d.limit_price,
            quantity,
            leverage: d.leverage,
            stop_loss: d.stop_loss,
            take_profit: d.take_profit,
            status: perppilot_exchange::VenueOrderStatus::New,
            filled_qty: Decimal::ZERO,
            ai_direction: direction,
            create_time: Utc::now(),
            update_time: Utc::now(),
            reasoning: d.reasoning.clone(),
        })?;
        Ok(())
    }

    async fn execute_close(&mut self, d: &Decision, ctx: &TickContext) -> anyhow::Result<()> {
        let side = d
            .action
            .side()
            .ok_or_else(|| anyhow::anyhow!("{:?} carries no side", d.action))?;

        let ack = match side {
            PositionSide::Long => self.trader.close_long(&d.symbol, Decimal::ZERO).await?,
            PositionSide::Short => self.trader.close_short(&d.symbol, Decimal::ZERO).await?,
        };

        if let Some(pnl) = ack.realized_pnl {
            let pnl = pnl.to_f64().unwrap_or(0.0);
            self.daily_pnl += pnl;
            info!(symbol = %d.symbol, realized_pnl = pnl, daily_pnl = self.daily_pnl, "position closed");
        }

        self.constraints.record_close_position(&d.symbol, side);
        self.manual_close_tracker
            .insert(position_key(&d.symbol, side), Utc::now());

        if let Some(position) = ctx
            .positions
            .iter()
            .find(|p| p.symbol == d.symbol && p.side == side)
        {
            let entry = self.trade_entry_for_close(d, position, ctx);
            if let Err(err) = self.memory.add_trade(entry) {
                warn!(error = %err, "failed to record close in memory");
            }
        }
        Ok(())
    }

    fn trade_entry_for_open(&self, d: &Decision, side: PositionSide, ctx: &TickContext) -> TradeEntry {
        TradeEntry {
            trade_id: 0,
            cycle: self.cycle,
            timestamp: Utc::now(),
            market_regime: self.market_regime(ctx),
            action: TradeAction::Open,
            symbol: d.symbol.clone(),
            side,
            signals: extract_signals(&d.reasoning),
            reasoning: d.reasoning.clone(),
            predicted_direction: Some(match side {
                PositionSide::Long => Direction::Up,
                PositionSide::Short => Direction::Down,
            }),
            predicted_prob: f64::from(d.confidence) / 100.0,
            predicted_move: 0.0,
            entry_price: d.current_price,
            exit_price: 0.0,
            position_pct: if ctx.account.total_equity > 0.0 {
                d.position_size_usd / f64::from(d.leverage.max(1)) / ctx.account.total_equity
                    * 100.0
            } else {
                0.0
            },
            leverage: d.leverage,
            is_limit_order: d.is_limit_order,
            limit_price: d.limit_price,
            current_price: d.current_price,
            hold_minutes: 0,
            return_pct: 0.0,
            result: None,
        }
    }

    fn trade_entry_for_close(
        &self,
        d: &Decision,
        position: &PositionInfo,
        ctx: &TickContext,
    ) -> TradeEntry {
        let now = Utc::now();
        TradeEntry {
            trade_id: 0,
            cycle: self.cycle,
            timestamp: now,
            market_regime: self.market_regime(ctx),
            action: TradeAction::Close,
            symbol: d.symbol.clone(),
            side: position.side,
            signals: extract_signals(&d.reasoning),
            reasoning: d.reasoning.clone(),
            predicted_direction: None,
            predicted_prob: 0.0,
            predicted_move: 0.0,
            entry_price: position.entry_price.to_f64().unwrap_or(0.0),
            exit_price: position.mark_price.to_f64().unwrap_or(0.0),
            position_pct: if ctx.account.total_equity > 0.0 {
                position.margin_used_f64() / ctx.account.total_equity * 100.0
            } else {
                0.0
            },
            leverage: position.leverage,
            is_limit_order: false,
            limit_price: 0.0,
            current_price: 0.0,
            hold_minutes: position.held_minutes(now).unwrap_or(0),
            return_pct: position.unrealized_pnl_pct,
            result: Some(TradeResult::from_return_pct(position.unrealized_pnl_pct)),
        }
    }

    fn market_regime(&self, ctx: &TickContext) -> String {
        ctx.snapshots
            .get("BTCUSDT")
            .map(|btc| {
                perppilot_core::regime::Regime::classify(
                    btc.price,
                    btc.ema50,
                    btc.ema200,
                    btc.atr_pct(),
                )
                .as_str()
                .to_string()
            })
            .unwrap_or_default()
    }

    /// Test/ops visibility into the memory store.
    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    #[must_use]
    pub const fn constraints(&self) -> &TradingConstraints {
        &self.constraints
    }
}

fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{}", side.as_str())
}

/// Signal keywords mined from decision reasoning for the memory store.
fn extract_signals(reasoning: &str) -> Vec<String> {
    const KEYWORDS: &[&str] = &[
        "macd", "rsi", "ema", "breakout", "breakdown", "divergence", "support", "resistance",
        "trend", "oversold", "overbought", "volume", "pullback", "momentum",
    ];
    let lower = reasoning.to_lowercase();
    KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .take(5)
        .map(|kw| (*kw).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::StaticUniverse;
    use perppilot_agents::AgentError;
    use perppilot_exchange::Trader;
    use perppilot_core::config::{
        AppConfig, ConstraintConfig, ExchangeConfig, GateConfig, LlmConfig, TraderConfig,
    };
    use perppilot_exchange::mock::MockTrader;
    use perppilot_market_data::IntradaySeries;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct ScriptedLlm {
        prediction_json: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn call(&self, system: &str, _user: &str) -> Result<String, AgentError> {
            if system.contains("market analyst") {
                Ok(r#"{"market_phase": "uptrend", "summary": "ok"}"#.to_string())
            } else {
                Ok(self.prediction_json.clone())
            }
        }
    }

    struct CannedSnapshots {
        snapshots: HashMap<String, MarketSnapshot>,
    }

    #[async_trait]
    impl SnapshotSource for CannedSnapshots {
        async fn snapshot(&self, symbol: &str) -> anyhow::Result<MarketSnapshot> {
            self.snapshots
                .get(symbol)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no snapshot for {symbol}"))
        }
    }

    fn snapshot(symbol: &str) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: 108_200.0,
            ema20: 107_500.0,
            ema50: 106_800.0,
            ema200: 100_000.0,
            atr3: 500.0,
            atr14: 800.0,
            rsi7: 60.0,
            rsi14: 55.0,
            macd: 120.0,
            macd_signal: 100.0,
            adx: 30.0,
            plus_di: 25.0,
            minus_di: 12.0,
            price_change_15m: 0.1,
            price_change_30m: 0.2,
            price_change_1h: 0.8,
            price_change_4h: 1.2,
            price_change_24h: 2.5,
            volume_24h: 1.0e9,
            current_volume: 1000.0,
            avg_volume: 900.0,
            open_interest: 80_000.0,
            funding_rate: 0.00005,
            intraday: IntradaySeries::default(),
            timestamp: Utc::now().timestamp(),
        }
    }

    fn config(data_dir: &std::path::Path) -> AppConfig {
        AppConfig {
            trader: TraderConfig {
                id: "test".to_string(),
                name: "test".to_string(),
                scan_interval_secs: 180,
                kline_interval: "5m".to_string(),
                initial_balance: 1000.0,
                btc_eth_leverage: 8,
                altcoin_leverage: 5,
                max_daily_loss_pct: 10.0,
                max_drawdown_pct: 25.0,
                stop_trading_minutes: 120,
                use_limit_orders: false,
                candidate_limit: 20,
                candidate_symbols: vec!["BTCUSDT".to_string()],
                data_dir: data_dir.to_string_lossy().to_string(),
            },
            exchange: ExchangeConfig::default(),
            llm: LlmConfig {
                api_url: "http://localhost".to_string(),
                api_key: String::new(),
                model: "test".to_string(),
                timeout_secs: 10,
            },
            constraints: ConstraintConfig::default(),
            gate: GateConfig::default(),
        }
    }

    async fn auto_trader(
        data_dir: &TempDir,
        trader: Arc<MockTrader>,
        prediction_json: &str,
        symbols: &[&str],
    ) -> AutoTrader {
        let mut snapshots = HashMap::new();
        for symbol in symbols {
            snapshots.insert((*symbol).to_string(), snapshot(symbol));
        }

        AutoTrader::new(AutoTraderDeps {
            config: config(data_dir.path()),
            trader,
            llm: Arc::new(ScriptedLlm { prediction_json: prediction_json.to_string() }),
            snapshots: Arc::new(CannedSnapshots { snapshots }),
            universe: Arc::new(StaticUniverse::new(
                symbols.iter().map(|s| (*s).to_string()).collect(),
            )),
            price_paths: None,
        })
        .await
        .unwrap()
    }

    const BULLISH: &str = r#"{"symbol":"BTCUSDT","direction":"up","probability":0.72,
"expected_move":2.5,"best_case":4.0,"worst_case":-2.0,"timeframe":"4h",
"confidence":"high","risk_level":"medium","reasoning":"trend with macd support","key_factors":[]}"#;

    const NEUTRAL: &str = r#"{"symbol":"BTCUSDT","direction":"neutral","probability":0.55,
"expected_move":0.2,"best_case":1.0,"worst_case":-1.0,"timeframe":"4h",
"confidence":"low","risk_level":"low","reasoning":"chop","key_factors":[]}"#;

    #[tokio::test]
    async fn bullish_tick_opens_and_protects_a_long() {
        let dir = TempDir::new().unwrap();
        let trader = Arc::new(MockTrader::new(dec!(1000)));
        trader.set_mark_price("BTCUSDT", dec!(108200));

        let mut at = auto_trader(&dir, Arc::clone(&trader), BULLISH, &["BTCUSDT"]).await;
        at.run_cycle().await.unwrap();

        let positions = trader.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);

        // Protective orders were installed.
        let open = trader.open_orders("BTCUSDT").await.unwrap();
        assert_eq!(open.iter().filter(|o| o.is_protective()).count(), 2);

        // Memory recorded the open.
        assert_eq!(at.memory().snapshot().total_trades, 1);
        // Constraints know the open time.
        assert!(at
            .constraints()
            .position_open_time("BTCUSDT", PositionSide::Long)
            .is_some());
    }

    #[tokio::test]
    async fn cooldown_blocks_reopen_within_twenty_minutes() {
        let dir = TempDir::new().unwrap();
        let trader = Arc::new(MockTrader::new(dec!(1000)));
        trader.set_mark_price("SOLUSDT", dec!(150));
        trader.set_mark_price("BTCUSDT", dec!(108200));

        let mut at =
            auto_trader(&dir, Arc::clone(&trader), BULLISH, &["SOLUSDT", "BTCUSDT"]).await;

        // Simulate the earlier close that starts the cooldown.
        at.constraints().record_close_position("SOLUSDT", PositionSide::Long);

        at.run_cycle().await.unwrap();

        // SOLUSDT was proposed but blocked; no SOL position exists.
        let positions = trader.positions().await.unwrap();
        assert!(positions.iter().all(|p| p.symbol != "SOLUSDT"));
    }

    #[tokio::test]
    async fn neutral_tick_does_nothing() {
        let dir = TempDir::new().unwrap();
        let trader = Arc::new(MockTrader::new(dec!(1000)));
        trader.set_mark_price("BTCUSDT", dec!(108200));

        let mut at = auto_trader(&dir, Arc::clone(&trader), NEUTRAL, &["BTCUSDT"]).await;
        at.run_cycle().await.unwrap();

        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disappeared_position_is_attributed_to_the_venue() {
        let dir = TempDir::new().unwrap();
        let trader = Arc::new(MockTrader::new(dec!(1000)));
        trader.set_mark_price("BTCUSDT", dec!(108200));

        let mut at = auto_trader(&dir, Arc::clone(&trader), NEUTRAL, &["BTCUSDT"]).await;

        // Tick 1 sees a long.
        trader.open_long("BTCUSDT", dec!(0.005), 5).await.unwrap();
        trader.set_mark_price("BTCUSDT", dec!(107000));
        at.run_cycle().await.unwrap();

        // The venue stop fires between ticks.
        trader.force_remove_position("BTCUSDT", PositionSide::Long);
        at.run_cycle().await.unwrap();

        let memory = at.memory().snapshot();
        let venue_exit = memory
            .recent_trades
            .iter()
            .find(|t| t.signals.iter().any(|s| s.contains("auto-triggered")))
            .expect("a venue-exit trade entry");
        assert_eq!(venue_exit.action, TradeAction::Close);
        assert!(venue_exit.signals[0].contains("stop-loss"));
    }

    #[tokio::test]
    async fn drawdown_breaker_pauses_the_loop() {
        let dir = TempDir::new().unwrap();
        // Equity collapsed to 700 against an initial 1000 (30% > 25% cap).
        let trader = Arc::new(MockTrader::new(dec!(700)));
        trader.set_mark_price("BTCUSDT", dec!(108200));

        let mut at = auto_trader(&dir, Arc::clone(&trader), BULLISH, &["BTCUSDT"]).await;
        at.run_cycle().await.unwrap();

        // No trade happened and the pause is armed.
        assert!(trader.positions().await.unwrap().is_empty());
        assert!(at.stop_until.is_some());

        // The next cycle is a no-op while paused.
        at.run_cycle().await.unwrap();
        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[test]
    fn signal_extraction_matches_keywords() {
        let signals = extract_signals("MACD momentum with RSI support above the trend line");
        assert!(signals.contains(&"macd".to_string()));
        assert!(signals.contains(&"rsi".to_string()));
        assert!(signals.contains(&"trend".to_string()));
        assert!(signals.len() <= 5);
    }
}
