use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BotConfig;
use crate::error::BotError;
use crate::exchange::{open_position, Exchange};
use crate::models::Direction;
use crate::notify::Notifier;
use crate::persistence::{DangerRecord, PositionStore};

/// What happens when every close attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Position may be unprotected: danger record, critical alert, fatal error
    Fatal,
    /// Protective orders are still in place: warning and a recoverable error
    Warn,
}

/// Reduce-only market close that is only trusted once the exchange shows zero size
pub struct EmergencyCloseManager {
    exchange: Arc<dyn Exchange>,
    store: PositionStore,
    notifier: Arc<Notifier>,
    inst_id: String,
    attempts: u32,
    verify_delay: Duration,
    backoff: Duration,
}

impl EmergencyCloseManager {
    pub fn new(
        config: &BotConfig,
        exchange: Arc<dyn Exchange>,
        store: PositionStore,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            exchange,
            store,
            notifier,
            inst_id: config.exchange.inst_id.clone(),
            attempts: config.execution.emergency_attempts.max(1),
            verify_delay: config.execution.close_check_delay(),
            backoff: config.execution.emergency_backoff(),
        }
    }

    /// Close the position, retrying with backoff
    ///
    /// Each attempt re-reads the position first and succeeds at once if it is
    /// already flat; otherwise it sends a reduce-only market order for the size
    /// the exchange reports and checks again after a short wait. Returns the
    /// attempt number that saw the position flat.
    pub async fn close(
        &self,
        direction: Direction,
        size: f64,
        reason: &str,
        escalation: Escalation,
    ) -> Result<u32, BotError> {
        tracing::warn!(direction = %direction, size, reason, "closing position at market");
        let mut direction = direction;
        let mut size = size;

        for attempt in 1..=self.attempts {
            match self.exchange.get_positions().await {
                Ok(positions) => match open_position(&positions) {
                    None => {
                        tracing::info!(attempt, "position already flat");
                        return Ok(attempt);
                    }
                    Some(p) => {
                        direction = p.direction();
                        size = p.size();
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "cannot read position, closing anyway");
                }
            }

            match self
                .exchange
                .place_market_order(direction.close_side(), size, true)
                .await
            {
                Ok(ack) => {
                    tracing::info!(attempt, ord_id = %ack.id, size, "close order accepted");
                    tokio::time::sleep(self.verify_delay).await;
                    match self.exchange.get_positions().await {
                        Ok(positions) if open_position(&positions).is_none() => {
                            tracing::info!(attempt, "close confirmed flat");
                            return Ok(attempt);
                        }
                        Ok(_) => tracing::warn!(attempt, "position still open after close order"),
                        Err(e) => tracing::warn!(attempt, error = %e, "cannot verify close"),
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "close order rejected");
                }
            }

            if attempt < self.attempts {
                let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }

        match escalation {
            Escalation::Fatal => {
                tracing::error!(direction = %direction, size, reason, "EMERGENCY CLOSE FAILED");
                let record = DangerRecord {
                    time: Utc::now(),
                    inst_id: self.inst_id.clone(),
                    direction,
                    size,
                    reason: reason.to_string(),
                };
                if let Err(e) = self.store.write_danger(&record) {
                    tracing::error!(error = %e, "failed to write danger record");
                }
                self.notifier
                    .critical(format!(
                        "🚨🚨 EMERGENCY CLOSE FAILED: {} {} {} may be UNPROTECTED ({}). Manual intervention required!",
                        self.inst_id, direction, size, reason
                    ))
                    .await;
                Err(BotError::EmergencyCloseFailed {
                    direction,
                    size,
                    attempts: self.attempts,
                })
            }
            Escalation::Warn => {
                tracing::error!(direction = %direction, size, reason, "close not confirmed, protective orders kept");
                self.notifier
                    .warning(format!(
                        "⚠️ Close of {} {} not confirmed ({}); stop-loss/take-profit left in place",
                        direction, size, reason
                    ))
                    .await;
                Err(BotError::CloseFailed {
                    direction,
                    size,
                    attempts: self.attempts,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionSettings;
    use crate::exchange::mock::{MockExchange, MockFailure, MockOp};
    use crate::notify::{MemorySink, Severity};
    use crate::persistence::DANGER_FILE;

    struct Fixture {
        exchange: Arc<MockExchange>,
        manager: EmergencyCloseManager,
        sink: MemorySink,
        store: PositionStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig {
            execution: ExecutionSettings::immediate(),
            ..BotConfig::default()
        };
        let exchange = Arc::new(MockExchange::new());
        let store = PositionStore::new(dir.path());
        let sink = MemorySink::new();
        let notifier = Arc::new(Notifier::new(
            Box::new(sink.clone()),
            "",
            Duration::from_secs(60),
        ));
        let manager = EmergencyCloseManager::new(&config, exchange.clone(), store.clone(), notifier);
        Fixture {
            exchange,
            manager,
            sink,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_closes_exchange_reported_size() {
        let f = fixture();
        f.exchange.set_position(Direction::Long, 0.7, 2000.0);

        let attempt = f
            .manager
            .close(Direction::Long, 1.0, "test", Escalation::Fatal)
            .await
            .unwrap();

        assert_eq!(attempt, 1);
        assert_eq!(f.exchange.position_size(), 0.0);
        let orders = f.exchange.calls_of(MockOp::PlaceMarket);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].detail, "sell 0.7 reduce_only=true");
    }

    #[tokio::test]
    async fn test_already_flat_sends_nothing() {
        let f = fixture();
        f.manager
            .close(Direction::Short, 2.54, "test", Escalation::Fatal)
            .await
            .unwrap();
        assert!(f.exchange.calls_of(MockOp::PlaceMarket).is_empty());
    }

    #[tokio::test]
    async fn test_retries_after_rejection() {
        let f = fixture();
        f.exchange.set_position(Direction::Short, 2.54, 1944.52);
        f.exchange
            .fail_next(MockOp::PlaceMarket, 1, MockFailure::Network);

        let attempt = f
            .manager
            .close(Direction::Short, 2.54, "test", Escalation::Fatal)
            .await
            .unwrap();

        assert_eq!(attempt, 2);
        assert_eq!(f.exchange.position_size(), 0.0);
    }

    #[tokio::test]
    async fn test_accepted_but_not_flat_is_not_success() {
        let f = fixture();
        f.exchange.set_position(Direction::Long, 1.0, 2000.0);
        f.exchange.set_market_orders_fill(false);

        let err = f
            .manager
            .close(Direction::Long, 1.0, "stop-loss missing", Escalation::Fatal)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(f.exchange.calls_of(MockOp::PlaceMarket).len(), 3);
        assert!(f.store.dir().join(DANGER_FILE).exists());
        let danger = f.store.load_danger().unwrap();
        assert_eq!(danger.direction, Direction::Long);
        assert_eq!(danger.reason, "stop-loss missing");
        assert_eq!(f.sink.count(Severity::Critical), 1);
    }

    #[tokio::test]
    async fn test_warn_escalation_is_not_fatal() {
        let f = fixture();
        f.exchange.set_position(Direction::Long, 1.0, 2000.0);
        f.exchange.set_market_orders_fill(false);

        let err = f
            .manager
            .close(Direction::Long, 1.0, "max hold", Escalation::Warn)
            .await
            .unwrap_err();

        assert!(matches!(err, BotError::CloseFailed { .. }));
        assert!(!err.is_fatal());
        assert!(f.store.load_danger().is_none());
        assert_eq!(f.sink.count(Severity::Warning), 1);
    }
}
