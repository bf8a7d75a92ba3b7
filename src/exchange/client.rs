use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::retry::{with_retry, RetryConfig};
use super::signing::{rest_timestamp, sign};
use super::types::{
    parse_candle_row, AccountBalance, AlgoKind, AlgoOrder, BalanceRow, Envelope, ExchangePosition,
    Fill, Instrument, OpenOrder, OrderAck, OrderAckRow, OrderDetail, Ticker,
};
use super::{fmt_decimal, Exchange, ExchangeResult};
use crate::config::{Credentials, ExchangeSettings};
use crate::error::ExchangeError;
use crate::models::{Candle, OrderSide};

const API_PREFIX: &str = "/api/v5";
const MARGIN_MODE: &str = "isolated";
/// Code OKX uses for "too many requests" inside a 200 response
const CODE_RATE_LIMITED: &str = "50011";
/// Duplicate `clOrdId` / `algoClOrdId`: an earlier attempt of the same placement got through
const DUPLICATE_CLIENT_ID_CODES: [&str; 2] = ["51016", "51065"];

pub type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared request limiter; one per account, shared by every client in a pool
pub fn rate_limiter(requests_per_second: u32) -> Arc<OkxRateLimiter> {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rps)))
}

/// Signed OKX v5 REST client bound to one instrument
///
/// Cloneable; clones share the HTTP connection pool and the rate limiter.
#[derive(Clone)]
pub struct OkxClient {
    http: Client,
    base_url: String,
    inst_id: String,
    simulated: bool,
    credentials: Arc<Credentials>,
    retry: RetryConfig,
    rate_limiter: Arc<OkxRateLimiter>,
}

impl OkxClient {
    pub fn new(settings: &ExchangeSettings, credentials: Credentials) -> ExchangeResult<Self> {
        Self::with_rate_limiter(
            settings,
            Arc::new(credentials),
            rate_limiter(settings.requests_per_second),
        )
    }

    pub fn with_rate_limiter(
        settings: &ExchangeSettings,
        credentials: Arc<Credentials>,
        rate_limiter: Arc<OkxRateLimiter>,
    ) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            inst_id: settings.inst_id.clone(),
            simulated: settings.simulated,
            credentials,
            retry: RetryConfig {
                max_retries: settings.max_retries,
                base_delay: Duration::from_millis(settings.retry_base_delay_ms),
                ..RetryConfig::default()
            },
            rate_limiter,
        })
    }

    /// Override the retry policy (tests use a zero-delay policy)
    pub fn with_retry_policy(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn inst_id(&self) -> &str {
        &self.inst_id
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<Vec<T>> {
        self.request(Method::GET, endpoint, params, None).await
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> ExchangeResult<Vec<T>> {
        self.request(Method::POST, endpoint, &[], Some(body)).await
    }

    /// Build the URL, then send with retries on transient failures
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> ExchangeResult<Vec<T>> {
        let mut url = Url::parse(&format!("{}{}{}", self.base_url, API_PREFIX, endpoint))
            .map_err(|e| ExchangeError::Network(format!("invalid url: {}", e)))?;
        if !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        }
        let body = body.map(|b| b.to_string()).unwrap_or_default();

        let data = with_retry(&self.retry, || self.send_once(method.clone(), &url, &body)).await?;
        serde_json::from_value(Value::Array(data)).map_err(ExchangeError::from)
    }

    async fn send_once(&self, method: Method, url: &Url, body: &str) -> ExchangeResult<Vec<Value>> {
        self.rate_limiter.until_ready().await;

        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let timestamp = rest_timestamp();
        let signature = sign(
            &self.credentials.secret_key,
            &timestamp,
            method.as_str(),
            &path,
            body,
        )?;

        let mut req = self
            .http
            .request(method, url.clone())
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json");
        if self.simulated {
            req = req.header("x-simulated-trading", "1");
        }
        if !body.is_empty() {
            req = req.body(body.to_string());
        }

        let response = req.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Http {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        let envelope: Envelope<Value> = serde_json::from_str(&text)?;
        if envelope.code == "0" {
            return Ok(envelope.data);
        }
        if envelope.code == CODE_RATE_LIMITED {
            return Err(ExchangeError::RateLimited);
        }

        // Order endpoints put the real reason in the per-item status
        let item = envelope
            .data
            .first()
            .and_then(|d| serde_json::from_value::<OrderAckRow>(d.clone()).ok())
            .filter(|row| !row.s_code.is_empty() && row.s_code != "0");
        Err(match item {
            Some(row) => ExchangeError::Api {
                code: row.s_code,
                msg: row.s_msg,
            },
            None => ExchangeError::Api {
                code: envelope.code,
                msg: envelope.msg,
            },
        })
    }

    /// First acknowledgement row, checked for a per-item error
    fn first_ack(rows: Vec<OrderAckRow>, endpoint: &str, algo: bool) -> ExchangeResult<OrderAck> {
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::EmptyResponse(endpoint.to_string()))?;
        if !row.s_code.is_empty() && row.s_code != "0" {
            return Err(ExchangeError::Api {
                code: row.s_code,
                msg: row.s_msg,
            });
        }
        let id = if algo { row.algo_id } else { row.ord_id };
        if id.is_empty() {
            return Err(ExchangeError::EmptyResponse(endpoint.to_string()));
        }
        Ok(OrderAck {
            id,
            client_id: row.cl_ord_id,
        })
    }

    async fn place_order(&self, mut body: Value) -> ExchangeResult<OrderAck> {
        let client_id = new_client_id();
        body["clOrdId"] = Value::String(client_id.clone());
        let placed = match self.post::<OrderAckRow>("/trade/order", body).await {
            Ok(rows) => Self::first_ack(rows, "/trade/order", false),
            Err(e) => Err(e),
        };
        match placed {
            Ok(mut ack) => {
                if ack.client_id.is_empty() {
                    ack.client_id = client_id;
                }
                Ok(ack)
            }
            Err(e) if placement_uncertain(&e) => {
                let found = self
                    .get::<OrderDetail>(
                        "/trade/order",
                        &[("instId", self.inst_id.clone()), ("clOrdId", client_id.clone())],
                    )
                    .await;
                recover_ack(e, found.map(|rows| rows.into_iter().next().map(|o| o.ord_id)), client_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn place_algo(&self, mut body: Value) -> ExchangeResult<OrderAck> {
        let client_id = new_client_id();
        body["algoClOrdId"] = Value::String(client_id.clone());
        let placed = match self.post::<OrderAckRow>("/trade/order-algo", body).await {
            Ok(rows) => Self::first_ack(rows, "/trade/order-algo", true),
            Err(e) => Err(e),
        };
        match placed {
            Ok(mut ack) => {
                ack.client_id = client_id;
                Ok(ack)
            }
            Err(e) if placement_uncertain(&e) => {
                let found = self
                    .get::<AlgoOrder>("/trade/order-algo", &[("algoClOrdId", client_id.clone())])
                    .await;
                recover_ack(e, found.map(|rows| rows.into_iter().next().map(|a| a.algo_id)), client_id)
            }
            Err(e) => Err(e),
        }
    }
}

/// The placement may exist on the exchange even though the call failed
///
/// Either the retry budget ran out on a transport failure after the request
/// could have been processed, or a retry was rejected as a duplicate.
fn placement_uncertain(e: &ExchangeError) -> bool {
    match e {
        ExchangeError::RateLimited => false,
        ExchangeError::Api { code, .. } => DUPLICATE_CLIENT_ID_CODES.contains(&code.as_str()),
        other => other.is_retryable(),
    }
}

/// Ack for an order found by client id, else the original placement error
fn recover_ack(
    original: ExchangeError,
    found: ExchangeResult<Option<String>>,
    client_id: String,
) -> ExchangeResult<OrderAck> {
    match found {
        Ok(Some(id)) if !id.is_empty() => {
            tracing::warn!(client_id = %client_id, id = %id, error = %original, "placement failed but order exists, using it");
            Ok(OrderAck { id, client_id })
        }
        Ok(_) => Err(original),
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "lookup by client id failed");
            Err(original)
        }
    }
}

/// Client order id correlating a request with its acknowledgement
fn new_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl Exchange for OkxClient {
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        self.get(
            "/account/positions",
            &[("instType", "SWAP".to_string()), ("instId", self.inst_id.clone())],
        )
        .await
    }

    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        let rows: Vec<BalanceRow> = self.get("/account/balance", &[]).await?;
        rows.into_iter()
            .next()
            .map(AccountBalance::from)
            .ok_or_else(|| ExchangeError::EmptyResponse("/account/balance".to_string()))
    }

    async fn get_ticker(&self) -> ExchangeResult<Ticker> {
        let rows: Vec<Ticker> = self
            .get("/market/ticker", &[("instId", self.inst_id.clone())])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ExchangeError::EmptyResponse("/market/ticker".to_string()))
    }

    async fn get_candles(&self, bar: &str, limit: usize) -> ExchangeResult<Vec<Candle>> {
        let rows: Vec<Vec<String>> = self
            .get(
                "/market/candles",
                &[
                    ("instId", self.inst_id.clone()),
                    ("bar", bar.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        // Rows arrive newest first; the newest may still be forming
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| parse_candle_row(row))
            .filter(|(_, closed)| *closed)
            .map(|(candle, _)| candle)
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn get_instrument(&self) -> ExchangeResult<Instrument> {
        let rows: Vec<Instrument> = self
            .get(
                "/public/instruments",
                &[("instType", "SWAP".to_string()), ("instId", self.inst_id.clone())],
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ExchangeError::EmptyResponse("/public/instruments".to_string()))
    }

    async fn set_leverage(&self, leverage: u32) -> ExchangeResult<()> {
        let _: Vec<Value> = self
            .post(
                "/account/set-leverage",
                json!({
                    "instId": self.inst_id,
                    "lever": leverage.to_string(),
                    "mgnMode": MARGIN_MODE,
                }),
            )
            .await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        size: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let mut body = json!({
            "instId": self.inst_id,
            "tdMode": MARGIN_MODE,
            "side": side.as_str(),
            "ordType": "market",
            "sz": fmt_decimal(size),
        });
        if reduce_only {
            body["reduceOnly"] = Value::String("true".to_string());
        }
        self.place_order(body).await
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let mut body = json!({
            "instId": self.inst_id,
            "tdMode": MARGIN_MODE,
            "side": side.as_str(),
            "ordType": "limit",
            "sz": fmt_decimal(size),
            "px": fmt_decimal(price),
        });
        if reduce_only {
            body["reduceOnly"] = Value::String("true".to_string());
        }
        self.place_order(body).await
    }

    async fn place_stop_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.place_algo(json!({
            "instId": self.inst_id,
            "tdMode": MARGIN_MODE,
            "side": side.as_str(),
            "ordType": "conditional",
            "sz": fmt_decimal(size),
            "slTriggerPx": fmt_decimal(trigger_px),
            "slOrdPx": "-1",
            "slTriggerPxType": "last",
            "reduceOnly": "true",
        }))
        .await
    }

    async fn place_trigger_order(
        &self,
        side: OrderSide,
        size: f64,
        trigger_px: f64,
        order_px: f64,
    ) -> ExchangeResult<OrderAck> {
        self.place_algo(json!({
            "instId": self.inst_id,
            "tdMode": MARGIN_MODE,
            "side": side.as_str(),
            "ordType": "trigger",
            "sz": fmt_decimal(size),
            "triggerPx": fmt_decimal(trigger_px),
            "orderPx": fmt_decimal(order_px),
            "triggerPxType": "last",
        }))
        .await
    }

    async fn cancel_order(&self, ord_id: &str) -> ExchangeResult<()> {
        let rows: Vec<OrderAckRow> = self
            .post(
                "/trade/cancel-order",
                json!({ "instId": self.inst_id, "ordId": ord_id }),
            )
            .await?;
        Self::first_ack(rows, "/trade/cancel-order", false).map(|_| ())
    }

    async fn cancel_algo_order(&self, algo_id: &str) -> ExchangeResult<()> {
        let rows: Vec<OrderAckRow> = self
            .post(
                "/trade/cancel-algos",
                json!([{ "algoId": algo_id, "instId": self.inst_id }]),
            )
            .await?;
        Self::first_ack(rows, "/trade/cancel-algos", true).map(|_| ())
    }

    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        self.get(
            "/trade/orders-pending",
            &[("instType", "SWAP".to_string()), ("instId", self.inst_id.clone())],
        )
        .await
    }

    async fn get_algo_orders(&self, kind: AlgoKind) -> ExchangeResult<Vec<AlgoOrder>> {
        self.get(
            "/trade/orders-algo-pending",
            &[
                ("ordType", kind.as_str().to_string()),
                ("instType", "SWAP".to_string()),
                ("instId", self.inst_id.clone()),
            ],
        )
        .await
    }

    async fn get_algo_order_history(
        &self,
        kind: AlgoKind,
        state: &str,
    ) -> ExchangeResult<Vec<AlgoOrder>> {
        self.get(
            "/trade/orders-algo-history",
            &[
                ("ordType", kind.as_str().to_string()),
                ("state", state.to_string()),
                ("instType", "SWAP".to_string()),
                ("instId", self.inst_id.clone()),
                ("limit", "10".to_string()),
            ],
        )
        .await
    }

    async fn get_order(&self, ord_id: &str) -> ExchangeResult<Option<OrderDetail>> {
        let rows: Vec<OrderDetail> = self
            .get(
                "/trade/order",
                &[("instId", self.inst_id.clone()), ("ordId", ord_id.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_fills(&self, limit: usize) -> ExchangeResult<Vec<Fill>> {
        self.get(
            "/trade/fills",
            &[
                ("instType", "SWAP".to_string()),
                ("instId", self.inst_id.clone()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> OkxClient {
        let settings = ExchangeSettings {
            rest_url: server.url(),
            ..ExchangeSettings::default()
        };
        let creds = Credentials {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            passphrase: "pass".to_string(),
        };
        OkxClient::new(&settings, creds).unwrap().with_retry_policy(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        })
    }

    #[tokio::test]
    async fn test_get_positions_sends_auth_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v5/account/positions")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("instType".into(), "SWAP".into()),
                Matcher::UrlEncoded("instId".into(), "ETH-USDT-SWAP".into()),
            ]))
            .match_header("OK-ACCESS-KEY", "key")
            .match_header("OK-ACCESS-PASSPHRASE", "pass")
            .match_header("OK-ACCESS-SIGN", Matcher::Any)
            .match_header("OK-ACCESS-TIMESTAMP", Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"instId":"ETH-USDT-SWAP","pos":"-2.54","posSide":"net","avgPx":"1944.52"}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let positions = client.get_positions().await.unwrap();

        mock.assert_async().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].pos, -2.54);
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v5/trade/order-algo")
            .with_status(200)
            .with_body(r#"{"code":"1","msg":"Operation failed","data":[{"algoId":"","sCode":"51277","sMsg":"SL trigger price cannot be higher than the last price"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.place_stop_order(OrderSide::Sell, 1.0, 1960.0).await;

        mock.assert_async().await;
        match result {
            Err(ExchangeError::Api { code, .. }) => assert_eq!(code, "51277"),
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_429_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/api/v5/market/ticker")
            .match_query(Matcher::Any)
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.get_ticker().await;

        limited.assert_async().await;
        assert!(matches!(result, Err(ExchangeError::RateLimited)));
    }

    #[tokio::test]
    async fn test_stop_order_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v5/trade/order-algo")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "instId": "ETH-USDT-SWAP",
                "side": "sell",
                "ordType": "conditional",
                "sz": "1",
                "slTriggerPx": "1960",
                "slOrdPx": "-1",
                "reduceOnly": "true",
            })))
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"algoId":"sl-1","sCode":"0","sMsg":""}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let ack = client
            .place_stop_order(OrderSide::Sell, 1.0, 2000.0 * (1.0 - 0.02))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(ack.id, "sl-1");
        assert_eq!(ack.client_id.len(), 32);
    }

    #[tokio::test]
    async fn test_duplicate_after_lost_response_returns_existing_order() {
        let mut server = mockito::Server::new_async().await;
        let lost = server
            .mock("POST", "/api/v5/trade/order-algo")
            .with_status(502)
            .with_body("Bad Gateway")
            .expect(1)
            .create_async()
            .await;
        let duplicate = server
            .mock("POST", "/api/v5/trade/order-algo")
            .with_status(200)
            .with_body(r#"{"code":"1","msg":"","data":[{"algoId":"","sCode":"51065","sMsg":"algoClOrdId already exists"}]}"#)
            .expect(1)
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/api/v5/trade/order-algo")
            .match_query(Matcher::Regex("algoClOrdId=[0-9a-f]{32}".into()))
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"algoId":"trig-9","instId":"ETH-USDT-SWAP","ordType":"trigger","state":"live","side":"buy","sz":"1.5"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let ack = client
            .place_trigger_order(OrderSide::Buy, 1.5, 2050.0, 2052.05)
            .await
            .unwrap();

        lost.assert_async().await;
        duplicate.assert_async().await;
        lookup.assert_async().await;
        assert_eq!(ack.id, "trig-9");
        assert_eq!(ack.client_id.len(), 32);
    }

    #[tokio::test]
    async fn test_exhausted_retries_with_no_order_keep_the_error() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/api/v5/trade/order")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/api/v5/trade/order")
            .match_query(Matcher::UrlEncoded("instId".into(), "ETH-USDT-SWAP".into()))
            .with_status(200)
            .with_body(r#"{"code":"51603","msg":"Order does not exist","data":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.place_market_order(OrderSide::Sell, 1.0, true).await;

        failing.assert_async().await;
        lookup.assert_async().await;
        assert!(matches!(result, Err(ExchangeError::Http { status: 503, .. })));
    }

    #[test]
    fn test_placement_uncertainty() {
        assert!(placement_uncertain(&ExchangeError::Timeout));
        assert!(placement_uncertain(&ExchangeError::Http { status: 502, body: String::new() }));
        assert!(placement_uncertain(&ExchangeError::Api { code: "51016".into(), msg: String::new() }));
        assert!(!placement_uncertain(&ExchangeError::RateLimited));
        assert!(!placement_uncertain(&ExchangeError::Api { code: "51277".into(), msg: String::new() }));
    }

    #[tokio::test]
    async fn test_candles_are_oldest_first_and_closed_only() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v5/market/candles")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[
                    ["1700003600000","2010","2020","2000","2015","10","0","0","0"],
                    ["1700001800000","2005","2012","2001","2010","10","0","0","1"],
                    ["1700000000000","2000","2010","1990","2005","10","0","0","1"]
                ]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let candles = client.get_candles("30m", 3).await.unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 2005.0);
        assert_eq!(candles[1].close, 2010.0);
    }
}
