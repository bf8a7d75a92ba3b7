use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};

use super::emergency::{EmergencyCloseManager, Escalation};
use super::lifecycle::{LifecyclePhase, TriggerBook};
use super::market_feed::MarketDataFeed;
use crate::config::BotConfig;
use crate::error::{BotError, StoreError};
use crate::exchange::{open_position, AlgoKind, Exchange, Instrument};
use crate::models::{Candle, Direction, ExitReason, OrderSide, PositionDescriptor, TradeResult};
use crate::notify::Notifier;
use crate::persistence::PositionStore;
use crate::risk::{contracts_for, protective_levels, round_to_step};
use crate::strategy::EntryPlanner;
use crate::ws::PrivateEvent;

/// Fill price within this fraction of a target counts as that target
const EXIT_PRICE_TOLERANCE: f64 = 0.005;

/// Why `rebalance_triggers` placed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A trigger fired or a fill is being handled
    EntryInFlight,
    /// A fill raced in while old triggers were being cancelled
    FillRaced,
    /// An old trigger could not be cancelled and is still live
    CancelFailed,
    PositionOpen,
    FeedNotReady,
    NoSignal,
    /// Sized below the instrument minimum
    NoSize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceOutcome {
    Placed { direction: Direction, algo_id: String },
    Skipped(SkipReason),
}

/// Exchange position found for a trigger that was being cancelled
#[derive(Debug, Clone, Copy)]
struct MissedFill {
    direction: Direction,
    avg_px: f64,
    size: f64,
}

fn skipped(reason: SkipReason) -> (RebalanceOutcome, Option<MissedFill>) {
    (RebalanceOutcome::Skipped(reason), None)
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Stop-loss confirmed live; take-profit attempted
    Protected(PositionDescriptor),
    /// Protection could not be established and the position was closed
    EmergencyClosed { reason: String },
}

/// Owns the position state machine and every order the engine places
///
/// All methods take `&self`. Position, pending triggers and markers live
/// behind short-lived locks that are never held across an await; the
/// cancel/check/place sequence is serialized by `order_lock`.
pub struct OrderLifecycleController {
    config: Arc<BotConfig>,
    exchange: Arc<dyn Exchange>,
    store: PositionStore,
    notifier: Arc<Notifier>,
    emergency: EmergencyCloseManager,
    planner: Box<dyn EntryPlanner>,
    feed: Mutex<MarketDataFeed>,
    triggers: TriggerBook,
    position: Mutex<Option<PositionDescriptor>>,
    instrument: Mutex<Option<Instrument>>,
    order_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OrderLifecycleController {
    /// Build the controller, restoring position and pending triggers from disk
    pub fn new(
        config: Arc<BotConfig>,
        exchange: Arc<dyn Exchange>,
        store: PositionStore,
        notifier: Arc<Notifier>,
        planner: Box<dyn EntryPlanner>,
    ) -> Self {
        let position = store.load_position();
        let triggers = TriggerBook::new(store.load_pending());
        if position.is_some() {
            triggers.transition(LifecyclePhase::Protected);
        }
        let emergency =
            EmergencyCloseManager::new(&config, exchange.clone(), store.clone(), notifier.clone());
        let feed = MarketDataFeed::new(
            config.strategy.max_candles,
            config.strategy.min_candles.max(planner.min_candles()),
        );

        Self {
            config,
            exchange,
            store,
            notifier,
            emergency,
            planner,
            feed: Mutex::new(feed),
            triggers,
            position: Mutex::new(position),
            instrument: Mutex::new(None),
            order_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn emergency(&self) -> &EmergencyCloseManager {
        &self.emergency
    }

    /// Shared with the private stream so it can mark fired triggers at receipt
    pub fn triggers(&self) -> &TriggerBook {
        &self.triggers
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.triggers.phase()
    }

    pub fn position(&self) -> Option<PositionDescriptor> {
        lock(&self.position).clone()
    }

    /// Replace the tracked position and persist it
    pub fn set_position(&self, position: Option<PositionDescriptor>) -> Result<(), StoreError> {
        self.store.save_position(position.as_ref())?;
        *lock(&self.position) = position;
        Ok(())
    }

    pub fn feed_len(&self) -> usize {
        lock(&self.feed).len()
    }

    pub fn feed_ready(&self) -> bool {
        lock(&self.feed).ready()
    }

    /// Replace the candle window with REST history
    pub fn seed_feed(&self, candles: Vec<Candle>) {
        let mut feed = lock(&self.feed);
        feed.seed(candles);
        tracing::info!(bars = feed.len(), ready = feed.ready(), "candle window seeded");
    }

    pub fn closes(&self) -> Vec<f64> {
        lock(&self.feed).closes()
    }

    fn persist_pending(&self) -> Result<(), StoreError> {
        self.store.save_pending(&self.triggers.pending())
    }

    async fn instrument(&self) -> Result<Instrument, BotError> {
        if let Some(inst) = lock(&self.instrument).clone() {
            return Ok(inst);
        }
        let inst = self.exchange.get_instrument().await?;
        *lock(&self.instrument) = Some(inst.clone());
        Ok(inst)
    }

    fn round_price(&self, px: f64) -> f64 {
        let tick = lock(&self.instrument)
            .as_ref()
            .map(|i| i.tick_sz)
            .filter(|t| *t > 0.0)
            .unwrap_or(0.01);
        round_to_step(px, tick)
    }

    // ==================================================================
    // Entry triggers
    // ==================================================================

    /// Cancel resting entry triggers and place fresh ones, atomically
    ///
    /// Runs entirely under `order_lock`. Backs off whenever an entry is in
    /// flight, re-checking after every exchange call that could have let a
    /// fill race in. An entry that filled while its trigger was being
    /// cancelled is protected once the lock is released.
    pub async fn rebalance_triggers(&self) -> Result<RebalanceOutcome, BotError> {
        let (outcome, missed) = {
            let _order_guard = self.order_lock.lock().await;
            self.cancel_and_place().await?
        };

        if let Some(fill) = missed {
            tracing::warn!(
                direction = %fill.direction,
                avg_px = fill.avg_px,
                size = fill.size,
                "entry filled during trigger cancel, protecting it"
            );
            self.on_entry_filled(fill.direction, fill.avg_px, fill.size)
                .await?;
        }
        Ok(outcome)
    }

    async fn cancel_and_place(&self) -> Result<(RebalanceOutcome, Option<MissedFill>), BotError> {
        if self.triggers.entry_active() {
            tracing::info!("entry in progress, skipping cancel+place");
            return Ok(skipped(SkipReason::EntryInFlight));
        }

        let round = self.triggers.pending().entries();
        let mut failed_cancels = Vec::new();
        for (direction, algo_id) in &round {
            if let Err(e) = self.exchange.cancel_algo_order(algo_id).await {
                tracing::warn!(direction = %direction, algo_id = %algo_id, error = %e, "trigger cancel failed");
                failed_cancels.push((*direction, algo_id.clone()));
            } else {
                tracing::info!(direction = %direction, algo_id = %algo_id, "trigger cancelled");
            }
            self.triggers.clear_pending_if(*direction, algo_id);
        }
        self.persist_pending()?;

        if self.triggers.entry_active() {
            tracing::info!("trigger fired during cancel, aborting placement");
            return Ok(skipped(SkipReason::FillRaced));
        }

        if !failed_cancels.is_empty() && self.resolve_failed_cancels(&failed_cancels).await? {
            return Ok(skipped(SkipReason::CancelFailed));
        }

        let positions = self.exchange.get_positions().await?;
        if let Some(p) = open_position(&positions) {
            let direction = p.direction();
            let ours = round.iter().find(|(d, _)| *d == direction);
            if let (None, false, Some((_, algo_id))) =
                (self.position(), self.triggers.entry_in_progress(), ours)
            {
                if self.triggers.triggered().is_none() {
                    self.triggers.set_pending(direction, algo_id.clone());
                    self.triggers.mark_algo_effective(algo_id, p.size());
                }
                let fill = MissedFill {
                    direction,
                    avg_px: p.avg_px,
                    size: p.size(),
                };
                return Ok((RebalanceOutcome::Skipped(SkipReason::FillRaced), Some(fill)));
            }
            tracing::info!("position open, not placing triggers");
            return Ok(skipped(SkipReason::PositionOpen));
        }
        if self.position().is_some() {
            tracing::info!("position tracked, not placing triggers");
            return Ok(skipped(SkipReason::PositionOpen));
        }
        if self.triggers.entry_active() {
            tracing::info!("trigger fired before cancel, waiting for its fill");
            return Ok(skipped(SkipReason::FillRaced));
        }

        let closes = {
            let feed = lock(&self.feed);
            if !feed.ready() {
                tracing::info!(bars = feed.len(), "candle window not ready");
                None
            } else {
                Some(feed.closes())
            }
        };
        let Some(closes) = closes else {
            self.triggers.transition(LifecyclePhase::Idle);
            return Ok(skipped(SkipReason::FeedNotReady));
        };

        let Some(plan) = self.planner.plan(&closes) else {
            tracing::info!(planner = self.planner.name(), "no entry this bar");
            self.triggers.transition(LifecyclePhase::Idle);
            return Ok(skipped(SkipReason::NoSignal));
        };

        let instrument = self.instrument().await?;
        let balance = self.exchange.get_balance().await?;
        let ticker = self.exchange.get_ticker().await?;
        let Some(size) = contracts_for(balance.total_equity, ticker.last, &instrument, &self.config.risk)
        else {
            self.triggers.transition(LifecyclePhase::Idle);
            return Ok(skipped(SkipReason::NoSize));
        };

        if self.triggers.entry_active() {
            return Ok(skipped(SkipReason::FillRaced));
        }

        let trigger_px = self.round_price(plan.trigger_px);
        let order_px = self.round_price(plan.order_px);
        let ack = match self
            .exchange
            .place_trigger_order(plan.direction.entry_side(), size, trigger_px, order_px)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(direction = %plan.direction, error = %e, "trigger placement failed");
                self.triggers.transition(LifecyclePhase::Idle);
                return Err(e.into());
            }
        };

        self.triggers.set_pending(plan.direction, ack.id.clone());
        self.persist_pending()?;
        self.triggers.transition(LifecyclePhase::TriggerPending);

        let arrow = match plan.direction {
            Direction::Long => "📈",
            Direction::Short => "📉",
        };
        tracing::info!(
            direction = %plan.direction,
            algo_id = %ack.id,
            trigger_px,
            order_px,
            size,
            "{} entry trigger placed",
            arrow
        );

        let placed = RebalanceOutcome::Placed {
            direction: plan.direction,
            algo_id: ack.id,
        };
        Ok((placed, None))
    }

    /// After failed cancels: put back any trigger the exchange still lists,
    /// and mark any that fired in the meantime
    ///
    /// Returns true when placement must be aborted this round.
    async fn resolve_failed_cancels(&self, failed: &[(Direction, String)]) -> Result<bool, BotError> {
        let live = match self.exchange.get_algo_orders(AlgoKind::Trigger).await {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list triggers after failed cancel, keeping ids");
                for (direction, algo_id) in failed {
                    self.triggers.set_pending(*direction, algo_id.clone());
                }
                self.persist_pending()?;
                return Ok(true);
            }
        };

        let mut restored = false;
        let mut gone = Vec::new();
        for (direction, algo_id) in failed {
            if live.iter().any(|a| &a.algo_id == algo_id) {
                tracing::warn!(direction = %direction, algo_id = %algo_id, "trigger still live, keeping it");
                self.triggers.set_pending(*direction, algo_id.clone());
                restored = true;
            } else {
                gone.push((*direction, algo_id));
            }
        }

        if !gone.is_empty() {
            match self
                .exchange
                .get_algo_order_history(AlgoKind::Trigger, "effective")
                .await
            {
                Ok(history) => {
                    for (direction, algo_id) in gone {
                        if let Some(fired) = history.iter().find(|a| &a.algo_id == algo_id) {
                            tracing::warn!(direction = %direction, algo_id = %algo_id, "trigger fired while being cancelled");
                            self.triggers.set_pending(direction, algo_id.clone());
                            self.triggers.mark_algo_effective(algo_id, fired.sz);
                            restored = true;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "trigger history unavailable after failed cancel"),
            }
        }

        if restored {
            self.persist_pending()?;
        }
        // a fired trigger is handled by the position check that follows
        Ok(restored && !self.triggers.entry_active())
    }

    // ==================================================================
    // Fill handling
    // ==================================================================

    /// Protect a freshly filled entry: stop-loss first, then take-profit
    ///
    /// Returns `Protected` only once the stop-loss is seen live on the
    /// exchange. Any failure to get there closes the position at market and
    /// returns `EmergencyClosed`; if that close itself fails the error is fatal.
    pub async fn on_entry_filled(
        &self,
        direction: Direction,
        fill_price: f64,
        fill_size: f64,
    ) -> Result<EntryOutcome, BotError> {
        let _entry = self.triggers.begin_entry();
        self.triggers.transition(LifecyclePhase::EntryFilledUnprotected);
        tracing::info!(direction = %direction, fill_price, fill_size, "🎯 entry filled");

        let result = self.protect_entry(direction, fill_price, fill_size).await;
        if !matches!(result, Ok(EntryOutcome::Protected(_))) {
            self.triggers.transition(LifecyclePhase::Idle);
        }
        result
    }

    async fn protect_entry(
        &self,
        direction: Direction,
        fill_price: f64,
        fill_size: f64,
    ) -> Result<EntryOutcome, BotError> {
        let mut entry_price = fill_price;
        let mut size = fill_size;

        // One authoritative read covers both a bad fill price and a partial fill
        match self.exchange.get_positions().await {
            Ok(positions) => {
                if let Some(p) = open_position(&positions) {
                    if !(entry_price.is_finite() && entry_price > 0.0) {
                        tracing::warn!(avg_px = p.avg_px, "fill price unusable, using exchange average");
                        entry_price = p.avg_px;
                    }
                    if (p.size() - fill_size).abs() > 1e-9 {
                        tracing::warn!(reported = fill_size, exchange = p.size(), "fill size differs from exchange position");
                    }
                    size = p.size();
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot read position after fill"),
        }

        if !(entry_price.is_finite() && entry_price > 0.0) {
            tracing::error!("CRITICAL: no valid entry price, emergency close");
            return self
                .abort_entry(direction, size, "entry price unavailable")
                .await;
        }

        self.consume_entry_triggers(direction).await?;

        let (sl_raw, tp_raw) = protective_levels(direction, entry_price, &self.config.risk);
        let sl_price = self.round_price(sl_raw);
        let tp_price = self.round_price(tp_raw);
        let close_side = direction.close_side();

        let sl_ack = match self
            .exchange
            .place_stop_order(close_side, size, sl_price)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(error = %e, "STOP-LOSS PLACEMENT FAILED, emergency close");
                return self
                    .abort_entry(direction, size, &format!("stop-loss placement failed: {}", e))
                    .await;
            }
        };

        tokio::time::sleep(self.config.execution.sl_verify_delay()).await;
        if !self.stop_is_live(&sl_ack.id).await {
            tracing::error!(algo_id = %sl_ack.id, "stop-loss not live after placement, emergency close");
            return self
                .abort_entry(direction, size, "stop-loss not live after placement")
                .await;
        }
        self.triggers.transition(LifecyclePhase::Protected);

        let tp_order_id = match self
            .exchange
            .place_limit_order(close_side, size, tp_price, true)
            .await
        {
            Ok(ack) => Some(ack.id),
            Err(e) => {
                tracing::error!(error = %e, "take-profit placement failed, stop-loss active");
                self.notifier
                    .warning(format!(
                        "⚠️ Take-profit placement failed for {} {}; stop-loss only ({})",
                        direction, size, e
                    ))
                    .await;
                None
            }
        };

        let position = PositionDescriptor {
            direction,
            entry_price,
            size,
            sl_price,
            sl_order_id: sl_ack.id,
            tp_price,
            tp_order_id,
            entry_time: Utc::now(),
        };
        self.set_position(Some(position.clone()))?;

        tracing::info!(
            direction = %direction,
            entry_price,
            sl_price,
            tp_price,
            size,
            "position protected"
        );
        self.notifier
            .info(format!(
                "📊 {} {} @ {:.2}\nSL {:.2} ({:.1}%)\nTP {:.2} ({:.1}%)\nSize {}",
                direction,
                self.config.exchange.inst_id,
                entry_price,
                sl_price,
                self.config.risk.stop_loss_pct * 100.0,
                tp_price,
                self.config.risk.take_profit_pct * 100.0,
                size
            ))
            .await;

        Ok(EntryOutcome::Protected(position))
    }

    /// Clear both pending slots: this side's trigger is spent, the other side's is cancelled
    async fn consume_entry_triggers(&self, direction: Direction) -> Result<(), BotError> {
        let _order_guard = self.order_lock.lock().await;
        self.triggers.take_triggered();
        self.triggers.take_pending(direction);

        if let Some(algo_id) = self.triggers.take_pending(direction.opposite()) {
            match self.exchange.cancel_algo_order(&algo_id).await {
                Ok(()) => tracing::info!(algo_id = %algo_id, "opposite trigger cancelled"),
                Err(e) => tracing::warn!(algo_id = %algo_id, error = %e, "opposite trigger cancel failed"),
            }
        }
        self.persist_pending()?;
        Ok(())
    }

    /// Stop-loss present among live conditional orders, with one re-query on error
    async fn stop_is_live(&self, algo_id: &str) -> bool {
        for attempt in 1..=2 {
            match self.exchange.get_algo_orders(AlgoKind::Conditional).await {
                Ok(algos) => return algos.iter().any(|a| a.algo_id == algo_id),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "stop-loss verification query failed");
                }
            }
        }
        false
    }

    async fn abort_entry(
        &self,
        direction: Direction,
        size: f64,
        reason: &str,
    ) -> Result<EntryOutcome, BotError> {
        self.set_position(None)?;
        self.notifier
            .critical(format!(
                "🚨 {} {} {}: {}. Emergency close",
                self.config.exchange.inst_id, direction, size, reason
            ))
            .await;
        self.emergency
            .close(direction, size, reason, Escalation::Fatal)
            .await?;
        Ok(EntryOutcome::EmergencyClosed {
            reason: reason.to_string(),
        })
    }

    // ==================================================================
    // Private stream events
    // ==================================================================

    /// Apply one private-channel push, in arrival order
    pub async fn handle_private_event(&self, event: PrivateEvent) -> Result<(), BotError> {
        match event {
            PrivateEvent::AlgoUpdate {
                algo_id,
                state,
                side,
                size,
            } => {
                tracing::info!(algo_id = %algo_id, state = %state, side = %side, "algo update");
                if state != "effective" {
                    return Ok(());
                }
                if let Some(direction) = self.triggers.mark_algo_effective(&algo_id, size) {
                    tracing::info!(direction = %direction, algo_id = %algo_id, "🎯 entry trigger fired");
                    return Ok(());
                }
                // stop-loss or an order we do not track
                self.check_position_closed().await
            }
            PrivateEvent::OrderUpdate {
                ord_id,
                state,
                side,
                acc_fill_sz,
                avg_px,
                reduce_only,
            } => {
                if state != "filled" {
                    return Ok(());
                }
                tracing::info!(ord_id = %ord_id, side = %side, acc_fill_sz, avg_px, reduce_only, "order filled");

                // closes, take-profits and emergency exits never open a position
                if reduce_only {
                    return self.check_position_closed().await;
                }

                if let Some(triggered) = self.triggers.take_triggered() {
                    self.on_entry_filled(triggered.direction, avg_px, acc_fill_sz)
                        .await?;
                    return Ok(());
                }

                if self.position().is_none() {
                    let pending = self.triggers.pending();
                    let inferred = OrderSide::parse(&side).map(Direction::from_entry_side);
                    if let Some(direction) = inferred.filter(|d| pending.get(*d).is_some()) {
                        tracing::warn!(direction = %direction, side = %side, "fill before trigger event, inferring entry");
                        self.on_entry_filled(direction, avg_px, acc_fill_sz).await?;
                        return Ok(());
                    }
                }
                self.check_position_closed().await
            }
        }
    }

    /// A closed bar arrived: check the open position, then re-arm if flat
    pub async fn on_candle_closed(&self, candle: Candle) -> Result<(), BotError> {
        let close = candle.close;
        let ts = candle.timestamp;
        if !lock(&self.feed).push_closed(candle) {
            tracing::debug!(ts = %ts, "duplicate candle ignored");
            return Ok(());
        }
        tracing::info!(close, ts = %ts, "candle closed");

        match self.check_position().await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::error!(error = %e, "position check failed"),
        }

        if self.position().is_none() {
            self.rebalance_triggers().await?;
        }
        Ok(())
    }

    /// Give the exchange a moment to settle, then look for a close and re-arm
    pub async fn check_position_closed(&self) -> Result<(), BotError> {
        tokio::time::sleep(self.config.execution.close_check_delay()).await;
        if self.check_position().await?.is_some() {
            self.rebalance_triggers().await?;
        }
        Ok(())
    }

    // ==================================================================
    // Close detection
    // ==================================================================

    /// Detect an exchange-side close or enforce the max-hold timeout
    ///
    /// Returns the trade when this call recorded a close. A failed position
    /// query is an error; nothing is assumed from it.
    pub async fn check_position(&self) -> Result<Option<TradeResult>, BotError> {
        let Some(pos) = self.position() else {
            return Ok(None);
        };

        let positions = self.exchange.get_positions().await?;
        if open_position(&positions).is_none() {
            let reason = self.determine_exit_reason(&pos).await;
            let exit_price = self.determine_exit_price(&pos).await;
            tracing::info!(reason = %reason, exit_price, "position closed by exchange order");
            let trade = self.record_close(&pos, exit_price, reason).await?;
            self.cancel_protective_orders(&pos).await;
            return Ok(trade);
        }

        let held = (Utc::now() - pos.entry_time).to_std().unwrap_or_default();
        if held < self.config.max_hold() {
            return Ok(None);
        }

        tracing::info!(hours = held.as_secs_f64() / 3600.0, "max hold exceeded, closing");
        // Close first; SL/TP keep protecting the position until it is confirmed flat
        self.emergency
            .close(pos.direction, pos.size, "max hold exceeded", Escalation::Warn)
            .await?;
        self.cancel_protective_orders(&pos).await;

        let exit_price = self.determine_exit_price(&pos).await;
        let trade = self.record_close(&pos, exit_price, ExitReason::Timeout).await?;
        Ok(trade)
    }

    /// Attribute an exchange-side close
    ///
    /// Order of evidence: stop-loss in triggered algo history, take-profit order
    /// filled, then latest fill price within 0.5% of exactly one target.
    pub async fn determine_exit_reason(&self, pos: &PositionDescriptor) -> ExitReason {
        match self
            .exchange
            .get_algo_order_history(AlgoKind::Conditional, "effective")
            .await
        {
            Ok(history) if history.iter().any(|a| a.algo_id == pos.sl_order_id) => {
                return ExitReason::StopLoss;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "algo history unavailable"),
        }

        if let Some(tp_id) = &pos.tp_order_id {
            match self.exchange.get_order(tp_id).await {
                Ok(Some(detail)) if detail.state == "filled" => return ExitReason::TakeProfit,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "take-profit order lookup failed"),
            }
        }

        let fill_px = match self.exchange.get_fills(5).await {
            Ok(fills) => fills.first().map(|f| f.fill_px).unwrap_or(0.0),
            Err(e) => {
                tracing::warn!(error = %e, "fills unavailable");
                0.0
            }
        };
        classify_by_price(fill_px, pos.sl_price, pos.tp_price)
    }

    /// Latest fill, else take-profit average, else ticker, else entry
    async fn determine_exit_price(&self, pos: &PositionDescriptor) -> f64 {
        if let Ok(fills) = self.exchange.get_fills(5).await {
            if let Some(px) = fills.first().map(|f| f.fill_px).filter(|px| *px > 0.0) {
                return px;
            }
        }

        if let Some(tp_id) = &pos.tp_order_id {
            if let Ok(Some(detail)) = self.exchange.get_order(tp_id).await {
                if detail.avg_px > 0.0 {
                    return detail.avg_px;
                }
            }
        }

        match self.exchange.get_ticker().await {
            Ok(ticker) if ticker.last > 0.0 => {
                tracing::warn!("using ticker as exit price");
                ticker.last
            }
            _ => pos.entry_price,
        }
    }

    /// Log the round trip once and drop the position
    ///
    /// Returns `None` when the same trade was already recorded.
    pub async fn record_close(
        &self,
        pos: &PositionDescriptor,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<Option<TradeResult>, BotError> {
        let trade = TradeResult::from_close(pos, exit_price, reason, self.config.fees.taker, Utc::now());
        let appended = self.store.append_trade(&trade)?;

        let still_tracked = matches!(self.position(), Some(p) if p.entry_time == pos.entry_time);
        if still_tracked {
            self.set_position(None)?;
        }
        self.triggers.transition(LifecyclePhase::Idle);

        if !appended {
            tracing::info!(direction = %pos.direction, "close already recorded");
            return Ok(None);
        }

        tracing::info!(
            direction = %trade.direction,
            reason = %trade.exit_reason,
            exit_price,
            pnl_pct = trade.pnl_pct * 100.0,
            "trade recorded"
        );
        self.notifier
            .info(format!(
                "📊 Closed {} {}: {}\nPnL {:+.2}% ({} min)",
                trade.direction,
                self.config.exchange.inst_id,
                trade.exit_reason,
                trade.pnl_pct * 100.0,
                trade.hold_minutes
            ))
            .await;
        Ok(Some(trade))
    }

    /// Cancel leftover stop-loss and take-profit once flat
    async fn cancel_protective_orders(&self, pos: &PositionDescriptor) {
        if !pos.sl_order_id.is_empty() {
            if let Err(e) = self.exchange.cancel_algo_order(&pos.sl_order_id).await {
                tracing::debug!(error = %e, "stop-loss cancel (may already be gone)");
            }
        }
        if let Some(tp_id) = &pos.tp_order_id {
            if let Err(e) = self.exchange.cancel_order(tp_id).await {
                tracing::debug!(error = %e, "take-profit cancel (may already be gone)");
            }
        }
    }
}

/// Best-effort exit attribution from a fill price
fn classify_by_price(fill_px: f64, sl_price: f64, tp_price: f64) -> ExitReason {
    if fill_px <= 0.0 {
        return ExitReason::Unknown;
    }
    let near = |target: f64| target > 0.0 && (fill_px - target).abs() / target < EXIT_PRICE_TOLERANCE;
    match (near(sl_price), near(tp_price)) {
        (true, false) => ExitReason::StopLoss,
        (false, true) => ExitReason::TakeProfit,
        _ => ExitReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_price() {
        assert_eq!(classify_by_price(1961.0, 1960.0, 2060.0), ExitReason::StopLoss);
        assert_eq!(classify_by_price(2058.0, 1960.0, 2060.0), ExitReason::TakeProfit);
        assert_eq!(classify_by_price(2010.0, 1960.0, 2060.0), ExitReason::Unknown);
        assert_eq!(classify_by_price(0.0, 1960.0, 2060.0), ExitReason::Unknown);
    }

    #[test]
    fn test_ambiguous_price_is_unknown() {
        // stop tightened close to target: both within tolerance
        assert_eq!(classify_by_price(2000.0, 1995.0, 2005.0), ExitReason::Unknown);
    }
}
