use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use super::controller::{EntryOutcome, OrderLifecycleController, RebalanceOutcome};
use super::emergency::Escalation;
use super::lifecycle::LifecyclePhase;
use crate::error::BotError;
use crate::exchange::{open_position, AlgoKind, ExchangePosition};
use crate::models::PositionDescriptor;
use crate::risk::protective_levels;

/// Result of comparing the exchange position with local belief
#[derive(Debug, Clone, PartialEq)]
pub enum OrphanCheck {
    /// Exchange is flat
    Flat,
    /// Exchange position matches the tracked descriptor
    Tracked,
    /// An entry is in flight; nothing was touched
    EntryInFlight,
    /// Untracked position with a live stop-loss, now tracked
    Adopted(PositionDescriptor),
    /// Untracked position without a stop-loss, closed at market
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub orphan: OrphanCheck,
    /// Persisted trigger ids no longer live on the exchange
    pub stale_triggers_dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeriodicOutcome {
    /// Entry in flight, nothing checked
    Skipped,
    /// A close was detected and recorded
    Closed,
    Checked(OrphanCheck),
}

/// Repairs drift between exchange truth and local state
///
/// Runs at startup and on a timer. Every path backs off while an entry is in
/// flight so it never mistakes an unprotected fill window for an orphan.
pub struct ReconciliationService {
    controller: Arc<OrderLifecycleController>,
}

impl ReconciliationService {
    pub fn new(controller: Arc<OrderLifecycleController>) -> Self {
        Self { controller }
    }

    pub async fn startup(&self) -> Result<StartupReport, BotError> {
        tracing::info!("startup reconciliation");

        // A close that happened while we were down
        if self.controller.position().is_some() {
            if let Some(trade) = self.controller.check_position().await? {
                tracing::info!(reason = %trade.exit_reason, "recorded close missed while offline");
            }
        }

        let orphan = self.check_orphan().await?;
        let stale_triggers_dropped = self.validate_pending().await?;

        tracing::info!(orphan = ?orphan, stale_triggers_dropped, "reconciliation complete");
        Ok(StartupReport {
            orphan,
            stale_triggers_dropped,
        })
    }

    /// Timer-driven pass: close detection, orphan check, re-arm when idle
    pub async fn periodic(&self) -> Result<PeriodicOutcome, BotError> {
        let triggers = self.controller.triggers();
        if triggers.entry_active() {
            tracing::debug!("periodic: entry in progress, skip");
            return Ok(PeriodicOutcome::Skipped);
        }

        if let Some(trade) = self.controller.check_position().await? {
            tracing::info!(reason = %trade.exit_reason, "periodic: position closed");
            self.controller.rebalance_triggers().await?;
            return Ok(PeriodicOutcome::Closed);
        }

        let orphan = self.check_orphan().await?;

        if self.controller.position().is_none()
            && triggers.pending().is_empty()
            && !triggers.entry_active()
        {
            tracing::info!("periodic: flat with no pending trigger, re-arming");
            self.controller.rebalance_triggers().await?;
        }
        Ok(PeriodicOutcome::Checked(orphan))
    }

    /// Look for an exchange position the controller does not track
    pub async fn check_orphan(&self) -> Result<OrphanCheck, BotError> {
        let exchange = self.controller.exchange();
        let positions = exchange.get_positions().await?;
        let Some(pos) = open_position(&positions).cloned() else {
            return Ok(OrphanCheck::Flat);
        };
        if self.controller.position().is_some() {
            return Ok(OrphanCheck::Tracked);
        }
        if self.controller.triggers().entry_active() {
            tracing::info!("entry started during check, not treating as orphan");
            return Ok(OrphanCheck::EntryInFlight);
        }

        let direction = pos.direction();
        let size = pos.size();
        tracing::error!(direction = %direction, size, avg_px = pos.avg_px, "ORPHAN position");

        let stops = exchange.get_algo_orders(AlgoKind::Conditional).await?;
        if self.controller.triggers().entry_active() {
            return Ok(OrphanCheck::EntryInFlight);
        }

        let Some(stop) = stops.iter().find(|a| a.is_stop_loss()).cloned() else {
            tracing::error!("orphan has NO stop-loss, emergency closing");
            let notifier = self.controller.notifier();
            notifier
                .critical(format!(
                    "🚨 Unprotected position found: {} {} @ {:.2}. Closing at market",
                    direction, size, pos.avg_px
                ))
                .await;
            self.controller
                .emergency()
                .close(direction, size, "orphan position without stop-loss", Escalation::Fatal)
                .await?;
            self.controller.set_position(None)?;
            return Ok(OrphanCheck::Closed);
        };

        let descriptor = self.adopt(&pos, stop.algo_id, stop.sl_trigger_px).await;
        self.controller.set_position(Some(descriptor.clone()))?;
        self.controller.triggers().transition(LifecyclePhase::Protected);
        self.controller
            .notifier()
            .warning(format!(
                "⚠️ Recovered untracked position: {} {} @ {:.2}",
                descriptor.direction, descriptor.size, descriptor.entry_price
            ))
            .await;
        Ok(OrphanCheck::Adopted(descriptor))
    }

    /// Rebuild a descriptor from exchange data, falling back to configured percentages
    async fn adopt(
        &self,
        pos: &ExchangePosition,
        sl_order_id: String,
        sl_trigger_px: Option<f64>,
    ) -> PositionDescriptor {
        let direction = pos.direction();
        let (default_sl, default_tp) =
            protective_levels(direction, pos.avg_px, &self.controller.config().risk);

        let take_profit = match self.controller.exchange().get_open_orders().await {
            Ok(orders) => orders.into_iter().find(|o| o.reduce_only),
            Err(e) => {
                tracing::warn!(error = %e, "cannot list open orders while adopting");
                None
            }
        };

        let tp_price = take_profit
            .as_ref()
            .map(|o| o.px)
            .filter(|px| *px > 0.0)
            .unwrap_or(default_tp);

        PositionDescriptor {
            direction,
            entry_price: pos.avg_px,
            size: pos.size(),
            sl_price: sl_trigger_px.filter(|px| *px > 0.0).unwrap_or(default_sl),
            sl_order_id,
            tp_price,
            tp_order_id: take_profit.map(|o| o.ord_id),
            entry_time: pos.opened_at().unwrap_or_else(Utc::now),
        }
    }

    /// Drop persisted trigger ids that are no longer live; returns how many
    async fn validate_pending(&self) -> Result<usize, BotError> {
        let triggers = self.controller.triggers();
        let pending = triggers.pending();
        if pending.is_empty() {
            return Ok(0);
        }

        let exchange = self.controller.exchange();
        let mut live: HashSet<String> = HashSet::new();
        for kind in [AlgoKind::Trigger, AlgoKind::Conditional] {
            for algo in exchange.get_algo_orders(kind).await? {
                live.insert(algo.algo_id);
            }
        }

        let mut dropped = 0;
        for (direction, algo_id) in pending.entries() {
            if !live.contains(&algo_id) && triggers.clear_pending_if(direction, &algo_id) {
                tracing::info!(direction = %direction, algo_id = %algo_id, "cleared expired trigger");
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.controller.store().save_pending(&triggers.pending())?;
        }
        if triggers.pending().is_empty() && self.controller.position().is_none() {
            triggers.transition(LifecyclePhase::Idle);
        }
        Ok(dropped)
    }

    /// Recover a trigger that fired but whose fill never arrived
    ///
    /// Once the marker is older than the fill timeout: if the exchange shows a
    /// position the fill was missed and is handled now; if it is flat the
    /// limit leg is stale, so resting entry orders are cancelled, the marker is
    /// cleared and fresh triggers are placed. Returns true when it acted.
    pub async fn check_trigger_timeout(&self) -> Result<bool, BotError> {
        let triggers = self.controller.triggers();
        let Some(triggered) = triggers.triggered() else {
            return Ok(false);
        };
        if triggered.at.elapsed() < self.controller.config().execution.trigger_fill_timeout()
            || triggers.entry_in_progress()
        {
            return Ok(false);
        }

        let exchange = self.controller.exchange();
        let positions = exchange.get_positions().await?;

        if let Some(pos) = open_position(&positions).cloned() {
            tracing::warn!(
                direction = %triggered.direction,
                size = pos.size(),
                "fill confirmation missed, protecting exchange position"
            );
            triggers.take_triggered();
            let outcome = self
                .controller
                .on_entry_filled(pos.direction(), pos.avg_px, pos.size())
                .await?;
            if let EntryOutcome::EmergencyClosed { reason } = outcome {
                tracing::error!(reason = %reason, "missed fill closed at market");
            }
            return Ok(true);
        }

        tracing::warn!(
            direction = %triggered.direction,
            algo_id = %triggered.algo_id,
            "trigger fired but never filled, clearing stale entry"
        );
        match exchange.get_open_orders().await {
            Ok(orders) => {
                for order in orders.iter().filter(|o| !o.reduce_only) {
                    match exchange.cancel_order(&order.ord_id).await {
                        Ok(()) => tracing::info!(ord_id = %order.ord_id, "stale entry order cancelled"),
                        Err(e) => tracing::warn!(ord_id = %order.ord_id, error = %e, "stale order cancel failed"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot list resting orders"),
        }

        triggers.take_triggered();
        match self.controller.rebalance_triggers().await? {
            RebalanceOutcome::Placed { direction, algo_id } => {
                tracing::info!(direction = %direction, algo_id = %algo_id, "triggers re-armed");
            }
            RebalanceOutcome::Skipped(reason) => {
                tracing::info!(reason = ?reason, "re-arm skipped");
            }
        }
        Ok(true)
    }
}
