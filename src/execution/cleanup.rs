use crate::exchange::{open_position, AlgoKind, Exchange};

/// What shutdown cleanup did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub triggers_cancelled: usize,
    pub stops_cancelled: usize,
    pub orders_cancelled: usize,
    /// Position open or unknown: stop-loss and reduce-only orders were left alone
    pub protection_kept: bool,
}

/// Cancel entry orders on shutdown without ever unprotecting a position
///
/// Entry triggers and plain entry orders are always cancelled. Stop-loss
/// algos and reduce-only orders are cancelled only when the exchange
/// positively reports no open position.
pub async fn cleanup_on_shutdown(exchange: &dyn Exchange) -> CleanupReport {
    let mut report = CleanupReport::default();

    match exchange.get_algo_orders(AlgoKind::Trigger).await {
        Ok(algos) => {
            for algo in algos {
                match exchange.cancel_algo_order(&algo.algo_id).await {
                    Ok(()) => report.triggers_cancelled += 1,
                    Err(e) => tracing::warn!(algo_id = %algo.algo_id, error = %e, "trigger cancel failed"),
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot list triggers"),
    }

    let flat = match exchange.get_positions().await {
        Ok(positions) => open_position(&positions).is_none(),
        Err(e) => {
            tracing::warn!(error = %e, "position unknown, keeping protective orders");
            false
        }
    };
    report.protection_kept = !flat;

    if flat {
        match exchange.get_algo_orders(AlgoKind::Conditional).await {
            Ok(algos) => {
                for algo in algos {
                    match exchange.cancel_algo_order(&algo.algo_id).await {
                        Ok(()) => report.stops_cancelled += 1,
                        Err(e) => tracing::warn!(algo_id = %algo.algo_id, error = %e, "stop cancel failed"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot list stop orders"),
        }
    }

    match exchange.get_open_orders().await {
        Ok(orders) => {
            for order in orders.iter().filter(|o| flat || !o.reduce_only) {
                match exchange.cancel_order(&order.ord_id).await {
                    Ok(()) => report.orders_cancelled += 1,
                    Err(e) => tracing::warn!(ord_id = %order.ord_id, error = %e, "order cancel failed"),
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot list open orders"),
    }

    tracing::info!(
        triggers = report.triggers_cancelled,
        stops = report.stops_cancelled,
        orders = report.orders_cancelled,
        protection_kept = report.protection_kept,
        "shutdown cleanup done"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockFailure, MockOp};
    use crate::models::{Direction, OrderSide};

    fn seeded() -> MockExchange {
        let ex = MockExchange::new();
        ex.add_trigger("trig-1", OrderSide::Buy, 1.0, 2050.0);
        ex.add_stop_loss("sl-1", OrderSide::Sell, 1.0, 1960.0);
        ex.add_open_order("tp-1", OrderSide::Sell, 1.0, 2060.0, true);
        ex.add_open_order("entry-1", OrderSide::Buy, 1.0, 2052.0, false);
        ex
    }

    #[tokio::test]
    async fn test_open_position_keeps_protection() {
        let ex = seeded();
        ex.set_position(Direction::Long, 1.0, 2000.0);

        let report = cleanup_on_shutdown(&ex).await;

        assert!(report.protection_kept);
        assert_eq!(report.triggers_cancelled, 1);
        assert_eq!(report.stops_cancelled, 0);
        assert_eq!(report.orders_cancelled, 1);
        assert_eq!(ex.live_stops().len(), 1);
        assert_eq!(ex.open_orders().len(), 1);
        assert_eq!(ex.open_orders()[0].ord_id, "tp-1");
    }

    #[tokio::test]
    async fn test_flat_cancels_everything() {
        let ex = seeded();

        let report = cleanup_on_shutdown(&ex).await;

        assert!(!report.protection_kept);
        assert_eq!(report.triggers_cancelled, 1);
        assert_eq!(report.stops_cancelled, 1);
        assert_eq!(report.orders_cancelled, 2);
        assert!(ex.live_triggers().is_empty());
        assert!(ex.live_stops().is_empty());
        assert!(ex.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_position_keeps_protection() {
        let ex = seeded();
        ex.fail_next(MockOp::GetPositions, 1, MockFailure::Timeout);

        let report = cleanup_on_shutdown(&ex).await;

        assert!(report.protection_kept);
        assert_eq!(ex.live_stops().len(), 1);
        assert!(ex.calls_of(MockOp::CancelAlgo).iter().all(|c| c.detail != "sl-1"));
    }
}
