//! In-memory exchange for exercising the execution engine.
//!
//! Keeps just enough state (one position, live algo orders, resting orders,
//! fills, history) to behave like the real venue for a single instrument,
//! records every call, and lets tests inject failures or run a hook when a
//! given operation is invoked.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::types::{
    AccountBalance, AlgoKind, AlgoOrder, ExchangePosition, Fill, Instrument, OpenOrder, OrderAck,
    OrderDetail, Ticker,
};
use super::{Exchange, ExchangeResult};
use crate::error::ExchangeError;
use crate::models::{Candle, Direction, OrderSide};

/// Operations the mock can record, fail or hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetPositions,
    GetBalance,
    GetTicker,
    GetCandles,
    GetInstrument,
    SetLeverage,
    PlaceMarket,
    PlaceLimit,
    PlaceStop,
    PlaceTrigger,
    CancelOrder,
    CancelAlgo,
    GetOpenOrders,
    GetAlgoOrders,
    GetAlgoHistory,
    GetOrder,
    GetFills,
}

impl MockOp {
    /// Calls that change orders or positions on the exchange
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            MockOp::SetLeverage
                | MockOp::PlaceMarket
                | MockOp::PlaceLimit
                | MockOp::PlaceStop
                | MockOp::PlaceTrigger
                | MockOp::CancelOrder
                | MockOp::CancelAlgo
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub op: MockOp,
    pub detail: String,
}

/// Error to inject for a call
#[derive(Debug, Clone)]
pub enum MockFailure {
    Api(&'static str),
    Network,
    Timeout,
}

impl MockFailure {
    fn to_error(&self) -> ExchangeError {
        match self {
            MockFailure::Api(code) => ExchangeError::Api {
                code: code.to_string(),
                msg: "injected failure".to_string(),
            },
            MockFailure::Network => ExchangeError::Network("injected failure".to_string()),
            MockFailure::Timeout => ExchangeError::Timeout,
        }
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

struct MockState {
    position: Option<ExchangePosition>,
    trigger_algos: Vec<AlgoOrder>,
    conditional_algos: Vec<AlgoOrder>,
    open_orders: Vec<OpenOrder>,
    algo_history: Vec<AlgoOrder>,
    orders: HashMap<String, OrderDetail>,
    fills: Vec<Fill>,
    candles: Vec<Candle>,
    instrument: Instrument,
    ticker: Ticker,
    balance: AccountBalance,
    market_orders_fill: bool,
    stop_orders_go_live: bool,
    failures: HashMap<MockOp, VecDeque<MockFailure>>,
    hooks: HashMap<MockOp, Hook>,
    calls: Vec<MockCall>,
    next_id: u64,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                position: None,
                trigger_algos: Vec::new(),
                conditional_algos: Vec::new(),
                open_orders: Vec::new(),
                algo_history: Vec::new(),
                orders: HashMap::new(),
                fills: Vec::new(),
                candles: Vec::new(),
                instrument: Instrument {
                    inst_id: "ETH-USDT-SWAP".to_string(),
                    ct_val: 0.1,
                    lot_sz: 0.01,
                    min_sz: 0.01,
                    tick_sz: 0.01,
                },
                ticker: Ticker {
                    inst_id: "ETH-USDT-SWAP".to_string(),
                    last: 2000.0,
                    bid_px: 1999.9,
                    ask_px: 2000.1,
                    vol24h: 0.0,
                },
                balance: AccountBalance {
                    total_equity: 1000.0,
                    usdt_available: 1000.0,
                },
                market_orders_fill: true,
                stop_orders_go_live: true,
                failures: HashMap::new(),
                hooks: HashMap::new(),
                calls: Vec::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---- scenario setup ----

    pub fn set_position(&self, direction: Direction, size: f64, avg_px: f64) {
        let pos = match direction {
            Direction::Long => size,
            Direction::Short => -size,
        };
        self.lock().position = Some(ExchangePosition {
            inst_id: "ETH-USDT-SWAP".to_string(),
            pos,
            pos_side: "net".to_string(),
            avg_px,
            c_time: None,
        });
    }

    pub fn clear_position(&self) {
        self.lock().position = None;
    }

    pub fn add_stop_loss(&self, algo_id: &str, side: OrderSide, size: f64, trigger_px: f64) {
        self.lock().conditional_algos.push(AlgoOrder {
            algo_id: algo_id.to_string(),
            inst_id: "ETH-USDT-SWAP".to_string(),
            ord_type: "conditional".to_string(),
            state: "live".to_string(),
            side: side.as_str().to_string(),
            sz: size,
            trigger_px: None,
            sl_trigger_px: Some(trigger_px),
            tp_trigger_px: None,
        });
    }

    pub fn add_trigger(&self, algo_id: &str, side: OrderSide, size: f64, trigger_px: f64) {
        self.lock().trigger_algos.push(AlgoOrder {
            algo_id: algo_id.to_string(),
            inst_id: "ETH-USDT-SWAP".to_string(),
            ord_type: "trigger".to_string(),
            state: "live".to_string(),
            side: side.as_str().to_string(),
            sz: size,
            trigger_px: Some(trigger_px),
            sl_trigger_px: None,
            tp_trigger_px: None,
        });
    }

    pub fn add_open_order(&self, ord_id: &str, side: OrderSide, size: f64, px: f64, reduce_only: bool) {
        self.lock().open_orders.push(OpenOrder {
            ord_id: ord_id.to_string(),
            side: side.as_str().to_string(),
            ord_type: "limit".to_string(),
            px,
            sz: size,
            reduce_only,
            state: "live".to_string(),
        });
    }

    /// Make an algo order appear in the history with the given state
    pub fn add_algo_history(&self, algo_id: &str, state: &str) {
        self.lock().algo_history.push(AlgoOrder {
            algo_id: algo_id.to_string(),
            inst_id: "ETH-USDT-SWAP".to_string(),
            ord_type: "conditional".to_string(),
            state: state.to_string(),
            side: String::new(),
            sz: 0.0,
            trigger_px: None,
            sl_trigger_px: None,
            tp_trigger_px: None,
        });
    }

    pub fn set_order(&self, ord_id: &str, state: &str, avg_px: f64, acc_fill_sz: f64) {
        self.lock().orders.insert(
            ord_id.to_string(),
            OrderDetail {
                ord_id: ord_id.to_string(),
                state: state.to_string(),
                avg_px,
                acc_fill_sz,
            },
        );
    }

    /// Newest fill; becomes the first row returned by `get_fills`
    pub fn push_fill(&self, side: OrderSide, px: f64, size: f64) {
        self.lock().fills.insert(
            0,
            Fill {
                ord_id: String::new(),
                side: side.as_str().to_string(),
                fill_px: px,
                fill_sz: size,
                ts: None,
            },
        );
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.lock().candles = candles;
    }

    pub fn set_last_price(&self, last: f64) {
        self.lock().ticker.last = last;
    }

    pub fn set_equity(&self, equity: f64) {
        let mut s = self.lock();
        s.balance.total_equity = equity;
        s.balance.usdt_available = equity;
    }

    pub fn set_instrument(&self, instrument: Instrument) {
        self.lock().instrument = instrument;
    }

    /// When false, reduce-only market orders are acknowledged but change nothing
    pub fn set_market_orders_fill(&self, fill: bool) {
        self.lock().market_orders_fill = fill;
    }

    /// When false, stop orders are acknowledged but never show up as live
    pub fn set_stop_orders_go_live(&self, live: bool) {
        self.lock().stop_orders_go_live = live;
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: MockOp, times: usize, failure: MockFailure) {
        let mut s = self.lock();
        let queue = s.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(failure.clone());
        }
    }

    /// Run `hook` every time `op` is called, after the call is applied
    pub fn on_call<F>(&self, op: MockOp, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().hooks.insert(op, Arc::new(hook));
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: MockOp) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn mutating_calls(&self) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op.is_mutating())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn position_size(&self) -> f64 {
        self.lock().position.as_ref().map(|p| p.pos.abs()).unwrap_or(0.0)
    }

    pub fn live_triggers(&self) -> Vec<AlgoOrder> {
        self.lock().trigger_algos.clone()
    }

    pub fn live_stops(&self) -> Vec<AlgoOrder> {
        self.lock().conditional_algos.clone()
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.lock().open_orders.clone()
    }

    // ---- internals ----

    /// Record the call, then return any injected failure
    fn begin(&self, op: MockOp, detail: String) -> ExchangeResult<()> {
        let mut s = self.lock();
        s.calls.push(MockCall { op, detail });
        match s.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn run_hook(&self, op: MockOp) {
        let hook = self.lock().hooks.get(&op).cloned();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut s = self.lock();
        s.next_id += 1;
        format!("{}-{}", prefix, s.next_id)
    }

    fn ack(id: String) -> OrderAck {
        OrderAck {
            client_id: format!("cl{}", id.replace('-', "")),
            id,
        }
    }

    fn not_found() -> ExchangeError {
        ExchangeError::Api {
            code: "51400".to_string(),
            msg: "order does not exist".to_string(),
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        self.begin(MockOp::GetPositions, String::new())?;
        let result = self.lock().position.iter().cloned().collect();
        self.run_hook(MockOp::GetPositions);
        Ok(result)
    }

    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        self.begin(MockOp::GetBalance, String::new())?;
        Ok(self.lock().balance.clone())
    }

    async fn get_ticker(&self) -> ExchangeResult<Ticker> {
        self.begin(MockOp::GetTicker, String::new())?;
        Ok(self.lock().ticker.clone())
    }

    async fn get_candles(&self, bar: &str, limit: usize) -> ExchangeResult<Vec<Candle>> {
        self.begin(MockOp::GetCandles, format!("{} {}", bar, limit))?;
        let s = self.lock();
        let skip = s.candles.len().saturating_sub(limit);
        Ok(s.candles[skip..].to_vec())
    }

    async fn get_instrument(&self) -> ExchangeResult<Instrument> {
        self.begin(MockOp::GetInstrument, String::new())?;
        Ok(self.lock().instrument.clone())
    }

    async fn set_leverage(&self, leverage: u32) -> ExchangeResult<()> {
        self.begin(MockOp::SetLeverage, leverage.to_string())
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        size: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        self.begin(
            MockOp::PlaceMarket,
            format!("{} {} reduce_only={}", side, size, reduce_only),
        )?;
        let id = self.next_id("ord");
        {
            let mut s = self.lock();
            if s.market_orders_fill {
                let signed = match side {
                    OrderSide::Buy => size,
                    OrderSide::Sell => -size,
                };
                let last = s.ticker.last;
                let current = s.position.as_ref().map(|p| p.pos).unwrap_or(0.0);
                let next = if reduce_only && (current + signed).signum() != current.signum() {
                    0.0
                } else {
                    current + signed
                };
                if next.abs() < 1e-12 {
                    s.position = None;
                } else if let Some(p) = s.position.as_mut() {
                    p.pos = next;
                } else if !reduce_only {
                    s.position = Some(ExchangePosition {
                        inst_id: "ETH-USDT-SWAP".to_string(),
                        pos: next,
                        pos_side: "net".to_string(),
                        avg_px: last,
                        c_time: None,
                    });
                }
                s.fills.insert(
                    0,
                    Fill {
                        ord_id: id.clone(),
                        side: side.as_str().to_string(),
                        fill_px: last,
                        fill_sz: size,
                        ts: None,
                    },
                );
            }
        }
        self.run_hook(MockOp::PlaceMarket);
        Ok(Self::ack(id))
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        self.begin(
            MockOp::PlaceLimit,
            format!("{} {} @ {} reduce_only={}", side, size, price, reduce_only),
        )?;
        let id = self.next_id("ord");
        self.add_open_order(&id, side, size, price, reduce_only);
        self.run_hook(MockOp::PlaceLimit);
        Ok(Self::ack(id))
    }

    async fn place_stop_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.begin(MockOp::PlaceStop, format!("{} {} @ {}", side, size, trigger_px))?;
        let id = self.next_id("sl");
        if self.lock().stop_orders_go_live {
            self.add_stop_loss(&id, side, size, trigger_px);
        }
        self.run_hook(MockOp::PlaceStop);
        Ok(Self::ack(id))
    }

    async fn place_trigger_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
        order_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.begin(
            MockOp::PlaceTrigger,
            format!("{} {} @ {} -> {}", side, size, trigger_px, order_px),
        )?;
        let id = self.next_id("trig");
        self.add_trigger(&id, side, size, trigger_px);
        self.run_hook(MockOp::PlaceTrigger);
        Ok(Self::ack(id))
    }

    async fn cancel_order(&self, ord_id: &str) -> ExchangeResult<()> {
        self.begin(MockOp::CancelOrder, ord_id.to_string())?;
        let removed = {
            let mut s = self.lock();
            let before = s.open_orders.len();
            s.open_orders.retain(|o| o.ord_id != ord_id);
            s.open_orders.len() != before
        };
        self.run_hook(MockOp::CancelOrder);
        if removed {
            Ok(())
        } else {
            Err(Self::not_found())
        }
    }

    async fn cancel_algo_order(&self, algo_id: &str) -> ExchangeResult<()> {
        self.begin(MockOp::CancelAlgo, algo_id.to_string())?;
        let removed = {
            let mut s = self.lock();
            let before = s.trigger_algos.len() + s.conditional_algos.len();
            s.trigger_algos.retain(|a| a.algo_id != algo_id);
            s.conditional_algos.retain(|a| a.algo_id != algo_id);
            s.trigger_algos.len() + s.conditional_algos.len() != before
        };
        self.run_hook(MockOp::CancelAlgo);
        if removed {
            Ok(())
        } else {
            Err(Self::not_found())
        }
    }

    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        self.begin(MockOp::GetOpenOrders, String::new())?;
        Ok(self.lock().open_orders.clone())
    }

    async fn get_algo_orders(&self, kind: AlgoKind) -> ExchangeResult<Vec<AlgoOrder>> {
        self.begin(MockOp::GetAlgoOrders, kind.as_str().to_string())?;
        let s = self.lock();
        Ok(match kind {
            AlgoKind::Trigger => s.trigger_algos.clone(),
            AlgoKind::Conditional => s.conditional_algos.clone(),
        })
    }

    async fn get_algo_order_history(
        &self,
        kind: AlgoKind,
        state: &str,
    ) -> ExchangeResult<Vec<AlgoOrder>> {
        self.begin(MockOp::GetAlgoHistory, format!("{} {}", kind.as_str(), state))?;
        Ok(self
            .lock()
            .algo_history
            .iter()
            .filter(|a| a.state == state)
            .cloned()
            .collect())
    }

    async fn get_order(&self, ord_id: &str) -> ExchangeResult<Option<OrderDetail>> {
        self.begin(MockOp::GetOrder, ord_id.to_string())?;
        Ok(self.lock().orders.get(ord_id).cloned())
    }

    async fn get_fills(&self, limit: usize) -> ExchangeResult<Vec<Fill>> {
        self.begin(MockOp::GetFills, limit.to_string())?;
        Ok(self.lock().fills.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reduce_only_market_order_flattens() {
        let ex = MockExchange::new();
        ex.set_position(Direction::Short, 2.54, 1944.52);

        ex.place_market_order(OrderSide::Buy, 2.54, true).await.unwrap();

        assert_eq!(ex.position_size(), 0.0);
        assert!(ex.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let ex = MockExchange::new();
        ex.fail_next(MockOp::PlaceStop, 1, MockFailure::Api("51000"));

        assert!(ex.place_stop_order(OrderSide::Sell, 1.0, 1960.0).await.is_err());
        assert!(ex.place_stop_order(OrderSide::Sell, 1.0, 1960.0).await.is_ok());
        assert_eq!(ex.live_stops().len(), 1);
        assert_eq!(ex.calls_of(MockOp::PlaceStop).len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_unknown_algo_errors() {
        let ex = MockExchange::new();
        let err = ex.cancel_algo_order("missing").await.unwrap_err();
        assert_eq!(err.code(), Some("51400"));
        assert_eq!(ex.mutating_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_runs_after_call() {
        let ex = Arc::new(MockExchange::new());
        let inner = ex.clone();
        ex.on_call(MockOp::PlaceTrigger, move || inner.set_last_price(2100.0));

        ex.place_trigger_order(OrderSide::Buy, 1.0, 2050.0, 2052.0)
            .await
            .unwrap();

        assert_eq!(ex.get_ticker().await.unwrap().last, 2100.0);
        assert_eq!(ex.live_triggers().len(), 1);
    }
}
