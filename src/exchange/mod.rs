// Exchange gateway: signed REST client, worker client pool, and the trait the
// execution engine talks to
pub mod client;
pub mod mock;
pub mod pool;
pub mod retry;
pub mod signing;
pub mod types;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{Candle, OrderSide};

pub use client::OkxClient;
pub use mock::MockExchange;
pub use pool::{ClientPool, PooledExchange};
pub use retry::{with_retry, RetryConfig};
pub use types::{
    open_position, AccountBalance, AlgoKind, AlgoOrder, ExchangePosition, Fill, Instrument,
    OpenOrder, OrderAck, OrderDetail, Ticker,
};

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Typed operations against one instrument on the exchange
///
/// Implementations carry no business logic. Every call either returns the
/// exchange's answer or an error; a failed query is never reported as an
/// empty result.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn get_balance(&self) -> ExchangeResult<AccountBalance>;

    async fn get_ticker(&self) -> ExchangeResult<Ticker>;

    /// Closed candles, oldest first
    async fn get_candles(&self, bar: &str, limit: usize) -> ExchangeResult<Vec<Candle>>;

    async fn get_instrument(&self) -> ExchangeResult<Instrument>;

    async fn set_leverage(&self, leverage: u32) -> ExchangeResult<()>;

    async fn place_market_order(
        &self,
        side: OrderSide,
        size: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck>;

    async fn place_limit_order(
        &self,
        side: OrderSide,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck>;

    /// Reduce-only stop that sends a market order once `trigger_px` trades
    async fn place_stop_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
    ) -> ExchangeResult<OrderAck>;

    /// Entry trigger: a limit order at `order_px` placed once `trigger_px` trades
    async fn place_trigger_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
        order_px: f64,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, ord_id: &str) -> ExchangeResult<()>;

    async fn cancel_algo_order(&self, algo_id: &str) -> ExchangeResult<()>;

    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>>;

    /// Live algo orders of one kind
    async fn get_algo_orders(&self, kind: AlgoKind) -> ExchangeResult<Vec<AlgoOrder>>;

    /// Finished algo orders of one kind in the given state (`effective`, `canceled`, ...)
    async fn get_algo_order_history(
        &self,
        kind: AlgoKind,
        state: &str,
    ) -> ExchangeResult<Vec<AlgoOrder>>;

    async fn get_order(&self, ord_id: &str) -> ExchangeResult<Option<OrderDetail>>;

    /// Most recent fills first
    async fn get_fills(&self, limit: usize) -> ExchangeResult<Vec<Fill>>;
}

/// Format a size or price for the wire: up to 8 decimals, trailing zeros trimmed
pub fn fmt_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" {
        "0".to_string()
    } else {
        s.to_string()
    }
}
