use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use super::client::{rate_limiter, OkxClient, OkxRateLimiter};
use super::types::{
    AccountBalance, AlgoKind, AlgoOrder, ExchangePosition, Fill, Instrument, OpenOrder, OrderAck,
    OrderDetail, Ticker,
};
use super::{Exchange, ExchangeResult};
use crate::config::{Credentials, ExchangeSettings};
use crate::error::ExchangeError;
use crate::models::{Candle, OrderSide};

/// REST clients keyed by the runtime worker thread that uses them
///
/// Each worker lazily gets its own `OkxClient` (and so its own connection
/// pool). All clients share one account-wide rate limiter.
pub struct ClientPool {
    settings: ExchangeSettings,
    credentials: Arc<Credentials>,
    rate_limiter: Arc<OkxRateLimiter>,
    clients: Mutex<HashMap<ThreadId, OkxClient>>,
}

impl ClientPool {
    pub fn new(settings: ExchangeSettings, credentials: Credentials) -> Self {
        let rate_limiter = rate_limiter(settings.requests_per_second);
        Self {
            settings,
            credentials: Arc::new(credentials),
            rate_limiter,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client owned by the calling worker thread
    pub fn client_for_current_worker(&self) -> ExchangeResult<OkxClient> {
        let worker = std::thread::current().id();
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| ExchangeError::Worker("client pool lock poisoned".to_string()))?;

        if let Some(client) = clients.get(&worker) {
            return Ok(client.clone());
        }

        let client = OkxClient::with_rate_limiter(
            &self.settings,
            self.credentials.clone(),
            self.rate_limiter.clone(),
        )?;
        clients.insert(worker, client.clone());
        tracing::debug!(worker = ?worker, pool_size = clients.len(), "created REST client for worker");
        Ok(client)
    }

    /// Number of workers that own a client
    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Exchange` that runs every call on a runtime worker with that worker's client
///
/// The caller only awaits the spawned task, so the control loop never touches
/// a network handle itself.
#[derive(Clone)]
pub struct PooledExchange {
    pool: Arc<ClientPool>,
}

impl PooledExchange {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    async fn dispatch<T, F, Fut>(&self, op: F) -> ExchangeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(OkxClient) -> Fut + Send + 'static,
        Fut: Future<Output = ExchangeResult<T>> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let client = pool.client_for_current_worker()?;
            op(client).await
        })
        .await
        .map_err(|e| ExchangeError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl Exchange for PooledExchange {
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        self.dispatch(|c| async move { c.get_positions().await }).await
    }

    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        self.dispatch(|c| async move { c.get_balance().await }).await
    }

    async fn get_ticker(&self) -> ExchangeResult<Ticker> {
        self.dispatch(|c| async move { c.get_ticker().await }).await
    }

    async fn get_candles(&self, bar: &str, limit: usize) -> ExchangeResult<Vec<Candle>> {
        let bar = bar.to_string();
        self.dispatch(move |c| async move { c.get_candles(&bar, limit).await })
            .await
    }

    async fn get_instrument(&self) -> ExchangeResult<Instrument> {
        self.dispatch(|c| async move { c.get_instrument().await }).await
    }

    async fn set_leverage(&self, leverage: u32) -> ExchangeResult<()> {
        self.dispatch(move |c| async move { c.set_leverage(leverage).await })
            .await
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        size: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        self.dispatch(move |c| async move { c.place_market_order(side, size, reduce_only).await })
            .await
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        self.dispatch(move |c| async move {
            c.place_limit_order(side, size, price, reduce_only).await
        })
        .await
    }

    async fn place_stop_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.dispatch(move |c| async move { c.place_stop_order(side, size, trigger_px).await })
            .await
    }

    async fn place_trigger_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
        order_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.dispatch(move |c| async move {
            c.place_trigger_order(side, size, trigger_px, order_px).await
        })
        .await
    }

    async fn cancel_order(&self, ord_id: &str) -> ExchangeResult<()> {
        let ord_id = ord_id.to_string();
        self.dispatch(move |c| async move { c.cancel_order(&ord_id).await })
            .await
    }

    async fn cancel_algo_order(&self, algo_id: &str) -> ExchangeResult<()> {
        let algo_id = algo_id.to_string();
        self.dispatch(move |c| async move { c.cancel_algo_order(&algo_id).await })
            .await
    }

    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        self.dispatch(|c| async move { c.get_open_orders().await }).await
    }

    async fn get_algo_orders(&self, kind: AlgoKind) -> ExchangeResult<Vec<AlgoOrder>> {
        self.dispatch(move |c| async move { c.get_algo_orders(kind).await })
            .await
    }

    async fn get_algo_order_history(
        &self,
        kind: AlgoKind,
        state: &str,
    ) -> ExchangeResult<Vec<AlgoOrder>> {
        let state = state.to_string();
        self.dispatch(move |c| async move { c.get_algo_order_history(kind, &state).await })
            .await
    }

    async fn get_order(&self, ord_id: &str) -> ExchangeResult<Option<OrderDetail>> {
        let ord_id = ord_id.to_string();
        self.dispatch(move |c| async move { c.get_order(&ord_id).await })
            .await
    }

    async fn get_fills(&self, limit: usize) -> ExchangeResult<Vec<Fill>> {
        self.dispatch(move |c| async move { c.get_fills(limit).await })
            .await
    }
}
