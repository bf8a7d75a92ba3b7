use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::BotConfig;
use crate::error::BotError;
use crate::exchange::Exchange;
use crate::execution::{
    cleanup_on_shutdown, CleanupReport, OrderLifecycleController, ReconciliationService,
    StartupReport,
};
use crate::models::Candle;
use crate::notify::Notifier;
use crate::persistence::{PendingTriggers, PositionStore};
use crate::strategy::EntryPlanner;
use crate::ws::{spawn_candle_stream, spawn_private_stream, PrivateEvent};

const SEED_RETRY_DELAY: Duration = Duration::from_secs(3);
const CHANNEL_CAPACITY: usize = 256;

/// Periodic timer whose first tick is one period away; a slow handler
/// pushes the next tick back instead of bunching missed ones
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Something the control loop has to react to
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    CandleClosed(Candle),
    Private(PrivateEvent),
    /// Reconciliation timer
    Reconcile,
    /// Trigger-fill timeout timer
    TriggerWatch,
}

/// Wires streams, timers and the execution engine into one control loop
pub struct Monitor {
    config: Arc<BotConfig>,
    controller: Arc<OrderLifecycleController>,
    reconciler: ReconciliationService,
}

impl Monitor {
    pub fn new(
        config: Arc<BotConfig>,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<Notifier>,
        planner: Box<dyn EntryPlanner>,
    ) -> Self {
        let store = PositionStore::new(config.state_dir.clone());
        let controller = Arc::new(OrderLifecycleController::new(
            config.clone(),
            exchange,
            store,
            notifier,
            planner,
        ));
        let reconciler = ReconciliationService::new(controller.clone());
        Self {
            config,
            controller,
            reconciler,
        }
    }

    pub fn controller(&self) -> &Arc<OrderLifecycleController> {
        &self.controller
    }

    pub fn reconciler(&self) -> &ReconciliationService {
        &self.reconciler
    }

    /// Everything that happens before the first event is handled
    ///
    /// Seeds the candle window, sets leverage, reconciles against the
    /// exchange and arms triggers when flat.
    pub async fn startup(&self) -> Result<StartupReport, BotError> {
        if let Some(danger) = self.controller.store().load_danger() {
            tracing::error!(
                direction = %danger.direction,
                size = danger.size,
                reason = %danger.reason,
                "danger record present from {}",
                danger.time
            );
            self.controller
                .notifier()
                .warning(format!(
                    "⚠️ Unresolved danger record: {} {} {} ({}). Check the account",
                    danger.inst_id, danger.direction, danger.size, danger.reason
                ))
                .await;
        }

        self.seed_feed().await?;

        let leverage = self.config.exchange.leverage;
        if let Err(e) = self.controller.exchange().set_leverage(leverage).await {
            tracing::warn!(leverage, error = %e, "failed to set leverage, continuing");
        }

        let report = self.reconciler.startup().await?;

        if self.controller.position().is_none() && self.controller.triggers().pending().is_empty() {
            if let Err(e) = self.controller.rebalance_triggers().await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::error!(error = %e, "initial trigger placement failed");
            }
        }

        let position = match self.controller.position() {
            Some(p) => format!("{} {} @ {:.2}", p.direction, p.size, p.entry_price),
            None => "flat".to_string(),
        };
        self.controller
            .notifier()
            .info(format!(
                "🚀 Started {} {}x on {}: {} ({} bars)",
                self.config.exchange.inst_id,
                self.config.exchange.leverage,
                self.config.exchange.bar,
                position,
                self.controller.feed_len()
            ))
            .await;
        Ok(report)
    }

    async fn seed_feed(&self) -> Result<(), BotError> {
        let exchange = self.controller.exchange();
        let bar = &self.config.exchange.bar;
        let limit = self.config.strategy.initial_candles;

        let candles = match exchange.get_candles(bar, limit).await {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!(error = %e, "candle history fetch failed, retrying once");
                tokio::time::sleep(SEED_RETRY_DELAY).await;
                exchange
                    .get_candles(bar, limit)
                    .await
                    .map_err(|e| BotError::MarketData(e.to_string()))?
            }
        };
        self.controller.seed_feed(candles);
        Ok(())
    }

    /// Start up, run until stopped, then clean up
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<(), BotError> {
        tracing::info!(
            inst_id = %self.config.exchange.inst_id,
            bar = %self.config.exchange.bar,
            "starting monitor"
        );
        self.startup().await?;

        let (candle_tx, candle_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (private_tx, private_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let candle_task = spawn_candle_stream(&self.config, candle_tx, stop.clone());
        let private_task = spawn_private_stream(
            &self.config,
            self.controller.triggers().clone(),
            private_tx,
            stop.clone(),
        );

        let result = self.event_loop(candle_rx, private_rx, stop).await;

        candle_task.abort();
        private_task.abort();
        self.shutdown().await;
        result
    }

    /// Handle events in arrival order until the stop flag or a fatal error
    pub async fn event_loop(
        &self,
        mut candles: mpsc::Receiver<Candle>,
        mut private: mpsc::Receiver<PrivateEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), BotError> {
        let reconcile_every = Duration::from_secs(self.config.execution.reconcile_interval_secs.max(1));
        let watch_every =
            Duration::from_secs(self.config.execution.trigger_watch_interval_secs.max(1));
        let mut reconcile_tick = ticker(reconcile_every);
        let mut watch_tick = ticker(watch_every);

        loop {
            if *stop.borrow() {
                break;
            }
            let event = tokio::select! {
                Some(candle) = candles.recv() => MonitorEvent::CandleClosed(candle),
                Some(event) = private.recv() => MonitorEvent::Private(event),
                _ = reconcile_tick.tick() => MonitorEvent::Reconcile,
                _ = watch_tick.tick() => MonitorEvent::TriggerWatch,
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.handle(event).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "fatal error, stopping");
                    self.controller
                        .notifier()
                        .critical(format!("🚨 Bot stopping on fatal error: {}", e))
                        .await;
                    return Err(e);
                }
                Err(e) => tracing::error!(error = %e, "event handling failed"),
            }
        }

        tracing::info!("stop requested, leaving event loop");
        Ok(())
    }

    pub async fn handle(&self, event: MonitorEvent) -> Result<(), BotError> {
        match event {
            MonitorEvent::CandleClosed(candle) => self.controller.on_candle_closed(candle).await,
            MonitorEvent::Private(event) => self.controller.handle_private_event(event).await,
            MonitorEvent::Reconcile => {
                let outcome = self.reconciler.periodic().await?;
                tracing::debug!(outcome = ?outcome, "periodic reconciliation");
                Ok(())
            }
            MonitorEvent::TriggerWatch => {
                self.reconciler.check_trigger_timeout().await?;
                Ok(())
            }
        }
    }

    /// Cancel entry orders, keep protection if a position is open, forget pending ids
    pub async fn shutdown(&self) -> CleanupReport {
        tracing::info!("shutting down");
        let report = cleanup_on_shutdown(self.controller.exchange().as_ref()).await;

        self.controller
            .triggers()
            .replace_pending(PendingTriggers::default());
        if let Err(e) = self.controller.store().save_pending(&PendingTriggers::default()) {
            tracing::warn!(error = %e, "failed to clear pending triggers");
        }

        let message = if report.protection_kept {
            format!(
                "🛑 Stopped. Position kept with its protective orders ({} triggers cancelled)",
                report.triggers_cancelled
            )
        } else {
            format!(
                "🛑 Stopped flat ({} triggers, {} orders cancelled)",
                report.triggers_cancelled, report.orders_cancelled
            )
        };
        self.controller.notifier().info(message).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_does_not_bunch_ticks() {
        let mut tick = ticker(Duration::from_secs(10));
        tick.tick().await;
        let first = Instant::now();

        // handler runs for three periods
        tokio::time::sleep(Duration::from_secs(30)).await;
        tick.tick().await;
        let late = Instant::now();
        tick.tick().await;

        assert_eq!(late - first, Duration::from_secs(30));
        assert_eq!(Instant::now() - late, Duration::from_secs(10));
    }
}
