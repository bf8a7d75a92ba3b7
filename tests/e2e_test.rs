mod common;

use common::{candles, long_at_2050, memory_notifier, test_config};
use okxbot::exchange::mock::MockOp;
use okxbot::exchange::MockExchange;
use okxbot::execution::OrphanCheck;
use okxbot::models::{Direction, ExitReason, OrderSide};
use okxbot::monitor::Monitor;
use okxbot::notify::Severity;
use okxbot::ws::PrivateEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_full_trade_cycle() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(&dir));
    let exchange = Arc::new(MockExchange::new());
    exchange.set_candles(candles(20));
    let (notifier, sink) = memory_notifier();
    let monitor = Monitor::new(config, exchange.clone(), notifier, Box::new(long_at_2050()));

    // 1. Startup: history seeded, leverage set, flat -> trigger armed
    let report = monitor.startup().await.unwrap();
    assert_eq!(report.orphan, OrphanCheck::Flat);
    assert_eq!(monitor.controller().feed_len(), 10);
    assert_eq!(exchange.calls_of(MockOp::SetLeverage).len(), 1);
    let trigger_id = monitor
        .controller()
        .triggers()
        .pending()
        .get(Direction::Long)
        .map(str::to_string)
        .unwrap();
    assert_eq!(sink.count(Severity::Info), 1);

    // 2. Trigger fires, entry fills, protection goes on
    let (candle_tx, candle_rx) = mpsc::channel(16);
    let (private_tx, private_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        private_tx
            .send(PrivateEvent::AlgoUpdate {
                algo_id: trigger_id.clone(),
                state: "effective".to_string(),
                side: "buy".to_string(),
                size: 1.5,
            })
            .await
            .unwrap();
        exchange.set_position(Direction::Long, 1.5, 2050.0);
        private_tx
            .send(PrivateEvent::OrderUpdate {
                ord_id: "entry-1".to_string(),
                state: "filled".to_string(),
                side: "buy".to_string(),
                acc_fill_sz: 1.5,
                avg_px: 2050.0,
                reduce_only: false,
            })
            .await
            .unwrap();
        wait_for(|| monitor.controller().position().is_some()).await;

        // 3. Stop-loss hits on the exchange
        exchange.clear_position();
        exchange.add_algo_history("sl-2", "effective");
        exchange.push_fill(OrderSide::Sell, 2009.0, 1.5);
        private_tx
            .send(PrivateEvent::AlgoUpdate {
                algo_id: "sl-2".to_string(),
                state: "effective".to_string(),
                side: "sell".to_string(),
                size: 1.5,
            })
            .await
            .unwrap();
        wait_for(|| monitor.controller().position().is_none()).await;

        // 4. A new bar keeps things moving
        candle_tx.send(candles(21).pop().unwrap()).await.unwrap();
        wait_for(|| monitor.controller().feed_len() == 11).await;

        stop_tx.send(true).unwrap();
    };

    let (result, ()) = tokio::join!(monitor.event_loop(candle_rx, private_rx, stop_rx), driver);
    result.unwrap();

    let stop = exchange.calls_of(MockOp::PlaceStop);
    assert_eq!(stop.len(), 1);
    assert_eq!(stop[0].detail, "sell 1.5 @ 2009");

    let trades = monitor.controller().store().load_trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(trades[0].direction, Direction::Long);
    assert!(trades[0].pnl_pct < 0.0);

    // re-armed after the close
    assert!(!monitor.controller().triggers().pending().is_empty());

    // 5. Shutdown while flat cancels entry orders
    let cleanup = monitor.shutdown().await;
    assert!(!cleanup.protection_kept);
    assert!(exchange.live_triggers().is_empty());
    assert!(monitor.controller().store().load_pending().is_empty());
}

#[tokio::test]
async fn test_shutdown_with_open_position_keeps_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(&dir));
    let exchange = Arc::new(MockExchange::new());
    exchange.set_candles(candles(20));
    exchange.set_position(Direction::Short, 2.54, 1944.52);
    exchange.add_stop_loss("sl-77", OrderSide::Buy, 2.54, 1983.41);
    let (notifier, _sink) = memory_notifier();
    let monitor = Monitor::new(config, exchange.clone(), notifier, Box::new(long_at_2050()));

    let report = monitor.startup().await.unwrap();
    assert!(matches!(report.orphan, OrphanCheck::Adopted(_)));
    assert!(exchange.calls_of(MockOp::PlaceTrigger).is_empty());

    let cleanup = monitor.shutdown().await;

    assert!(cleanup.protection_kept);
    assert_eq!(exchange.live_stops().len(), 1);
    assert_eq!(exchange.position_size(), 2.54);
}

#[tokio::test]
async fn test_unclosable_orphan_stops_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(&dir));
    let exchange = Arc::new(MockExchange::new());
    exchange.set_candles(candles(20));
    exchange.set_position(Direction::Long, 1.0, 2000.0);
    exchange.set_market_orders_fill(false);
    let (notifier, sink) = memory_notifier();
    let monitor = Monitor::new(config, exchange.clone(), notifier, Box::new(long_at_2050()));

    let err = monitor.startup().await.unwrap_err();

    assert!(err.is_fatal());
    assert!(monitor.controller().store().load_danger().is_some());
    assert!(sink.count(Severity::Critical) >= 2);
}

#[tokio::test]
async fn test_event_loop_ends_on_stop_flag() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(&dir));
    let exchange = Arc::new(MockExchange::new());
    let (notifier, _sink) = memory_notifier();
    let monitor = Monitor::new(config, exchange, notifier, Box::new(long_at_2050()));

    let (_candle_tx, candle_rx) = mpsc::channel(1);
    let (_private_tx, private_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = watch::channel(false);
    stop_tx.send(true).unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        monitor.event_loop(candle_rx, private_rx, stop_rx),
    )
    .await
    .unwrap()
    .unwrap();
}
