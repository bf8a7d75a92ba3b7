#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use okxbot::config::{BotConfig, ExecutionSettings, StrategySettings};
use okxbot::exchange::MockExchange;
use okxbot::execution::{OrderLifecycleController, ReconciliationService};
use okxbot::models::{Candle, Direction};
use okxbot::notify::{MemorySink, Notifier};
use okxbot::persistence::PositionStore;
use okxbot::strategy::{EntryPlan, EntryPlanner};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Planner with a fixed answer, so tests control where triggers go
pub struct FixedPlanner(pub Option<EntryPlan>);

impl EntryPlanner for FixedPlanner {
    fn plan(&self, _closes: &[f64]) -> Option<EntryPlan> {
        self.0
    }

    fn name(&self) -> &str {
        "fixed"
    }

    fn min_candles(&self) -> usize {
        3
    }
}

pub fn long_at_2050() -> FixedPlanner {
    FixedPlanner(Some(EntryPlan {
        direction: Direction::Long,
        trigger_px: 2050.0,
        order_px: 2052.05,
    }))
}

pub fn test_config(dir: &TempDir) -> BotConfig {
    BotConfig {
        execution: ExecutionSettings::immediate(),
        strategy: StrategySettings {
            min_candles: 3,
            max_candles: 50,
            initial_candles: 10,
            ..StrategySettings::default()
        },
        state_dir: dir.path().to_path_buf(),
        ..BotConfig::default()
    }
}

pub fn candles(n: usize) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let close = 2000.0 + i as f64;
            Candle {
                timestamp: start + ChronoDuration::minutes(30 * i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

pub fn memory_notifier() -> (Arc<Notifier>, MemorySink) {
    let sink = MemorySink::new();
    let notifier = Arc::new(Notifier::new(
        Box::new(sink.clone()),
        "",
        Duration::from_secs(60),
    ));
    (notifier, sink)
}

pub struct Harness {
    pub exchange: Arc<MockExchange>,
    pub controller: Arc<OrderLifecycleController>,
    pub reconciler: ReconciliationService,
    pub sink: MemorySink,
    pub store: PositionStore,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(long_at_2050(), |_| {}, |_| {})
    }

    pub fn with_planner(planner: FixedPlanner) -> Self {
        Self::build(planner, |_| {}, |_| {})
    }

    /// Full control: adjust config and pre-populate the state dir before the
    /// controller loads it
    pub fn build(
        planner: FixedPlanner,
        tweak: impl FnOnce(&mut BotConfig),
        prepare: impl FnOnce(&PositionStore),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);

        let store = PositionStore::new(dir.path());
        prepare(&store);

        let exchange = Arc::new(MockExchange::new());
        let (notifier, sink) = memory_notifier();
        let controller = Arc::new(OrderLifecycleController::new(
            Arc::new(config),
            exchange.clone(),
            store.clone(),
            notifier,
            Box::new(planner),
        ));
        controller.seed_feed(candles(5));
        let reconciler = ReconciliationService::new(controller.clone());

        Self {
            exchange,
            controller,
            reconciler,
            sink,
            store,
            dir,
        }
    }
}
