use serde::Deserialize;
use serde_json::{json, Value};

use crate::exchange::types::parse_candle_row;
use crate::models::lenient::{bool_lenient, f64_lenient};
use crate::models::Candle;

/// One push from the private channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum PrivateEvent {
    /// `orders-algo` row: trigger or stop-loss changed state
    AlgoUpdate {
        algo_id: String,
        state: String,
        side: String,
        size: f64,
    },
    /// `orders` row: plain order changed state
    OrderUpdate {
        ord_id: String,
        state: String,
        side: String,
        acc_fill_sz: f64,
        avg_px: f64,
        reduce_only: bool,
    },
}

/// Control frame (`login`, `subscribe`, `error`, ...)
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WsEvent {
    pub event: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
}

impl WsEvent {
    pub fn is_error(&self) -> bool {
        self.event == "error" || (!self.code.is_empty() && self.code != "0")
    }
}

#[derive(Debug, Deserialize)]
struct ChannelArg {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct Push {
    arg: ChannelArg,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoRow {
    algo_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    side: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    sz: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRow {
    ord_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    side: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    acc_fill_sz: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    avg_px: f64,
    #[serde(default, deserialize_with = "bool_lenient")]
    reduce_only: bool,
}

/// Control frame, if the text is one
pub fn parse_event(text: &str) -> Option<WsEvent> {
    serde_json::from_str::<WsEvent>(text).ok()
}

fn parse_push(text: &str) -> Option<Push> {
    if text == "pong" {
        return None;
    }
    serde_json::from_str::<Push>(text).ok()
}

/// Events carried by a private-channel frame; empty for control frames and `pong`
pub fn parse_private(text: &str) -> Vec<PrivateEvent> {
    let Some(push) = parse_push(text) else {
        return Vec::new();
    };

    match push.arg.channel.as_str() {
        "orders-algo" => push
            .data
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<AlgoRow>(row) {
                Ok(r) => Some(PrivateEvent::AlgoUpdate {
                    algo_id: r.algo_id,
                    state: r.state,
                    side: r.side,
                    size: r.sz,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "unparsable algo row");
                    None
                }
            })
            .collect(),
        "orders" => push
            .data
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<OrderRow>(row) {
                Ok(r) => Some(PrivateEvent::OrderUpdate {
                    ord_id: r.ord_id,
                    state: r.state,
                    side: r.side,
                    acc_fill_sz: r.acc_fill_sz,
                    avg_px: r.avg_px,
                    reduce_only: r.reduce_only,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "unparsable order row");
                    None
                }
            })
            .collect(),
        other => {
            tracing::debug!(channel = other, "ignoring push");
            Vec::new()
        }
    }
}

/// Closed candles carried by a business-channel frame
pub fn parse_business(text: &str) -> Vec<Candle> {
    let Some(push) = parse_push(text) else {
        return Vec::new();
    };
    if !push.arg.channel.starts_with("candle") {
        return Vec::new();
    }

    push.data
        .into_iter()
        .filter_map(|row| serde_json::from_value::<Vec<String>>(row).ok())
        .filter_map(|row| parse_candle_row(&row))
        .filter_map(|(candle, closed)| closed.then_some(candle))
        .collect()
}

pub fn candle_subscription(bar: &str, inst_id: &str) -> Value {
    json!({
        "op": "subscribe",
        "args": [{"channel": format!("candle{}", bar), "instId": inst_id}]
    })
}

pub fn private_subscription() -> Value {
    json!({
        "op": "subscribe",
        "args": [
            {"channel": "orders", "instType": "SWAP"},
            {"channel": "orders-algo", "instType": "SWAP"}
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algo_push() {
        let text = r#"{"arg":{"channel":"orders-algo","instType":"SWAP","uid":"1"},
            "data":[{"algoId":"trig-1","state":"effective","side":"buy","sz":"1.5","instId":"ETH-USDT-SWAP"}]}"#;
        assert_eq!(
            parse_private(text),
            vec![PrivateEvent::AlgoUpdate {
                algo_id: "trig-1".into(),
                state: "effective".into(),
                side: "buy".into(),
                size: 1.5,
            }]
        );
    }

    #[test]
    fn test_order_push_with_empty_numbers() {
        let text = r#"{"arg":{"channel":"orders","instType":"SWAP"},
            "data":[{"ordId":"o1","state":"live","side":"sell","accFillSz":"","avgPx":""},
                    {"ordId":"o2","state":"filled","side":"buy","accFillSz":"2","avgPx":"2001.5","reduceOnly":"false"}]}"#;
        let events = parse_private(text);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            PrivateEvent::OrderUpdate {
                ord_id: "o2".into(),
                state: "filled".into(),
                side: "buy".into(),
                acc_fill_sz: 2.0,
                avg_px: 2001.5,
                reduce_only: false,
            }
        );
        assert!(matches!(&events[0], PrivateEvent::OrderUpdate { avg_px, .. } if *avg_px == 0.0));
    }

    #[test]
    fn test_order_push_carries_reduce_only() {
        let text = r#"{"arg":{"channel":"orders","instType":"SWAP"},
            "data":[{"ordId":"o3","state":"filled","side":"sell","accFillSz":"1","avgPx":"1990","reduceOnly":"true"}]}"#;
        let events = parse_private(text);
        assert!(matches!(&events[0], PrivateEvent::OrderUpdate { reduce_only: true, .. }));
    }

    #[test]
    fn test_control_frames_yield_nothing() {
        assert!(parse_private("pong").is_empty());
        assert!(parse_private(r#"{"event":"login","code":"0","msg":""}"#).is_empty());
        assert!(parse_business(r#"{"event":"subscribe","arg":{"channel":"candle30m"}}"#).is_empty());

        let ev = parse_event(r#"{"event":"error","code":"60009","msg":"Login failed."}"#).unwrap();
        assert!(ev.is_error());
        let ok = parse_event(r#"{"event":"login","code":"0","msg":""}"#).unwrap();
        assert!(!ok.is_error());
    }

    #[test]
    fn test_only_closed_candles() {
        let text = r#"{"arg":{"channel":"candle30m","instId":"ETH-USDT-SWAP"},"data":[
            ["1700000000000","2000","2010","1990","2005","12","0","0","1"],
            ["1700001800000","2005","2006","2001","2003","3","0","0","0"]]}"#;
        let candles = parse_business(text);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 2005.0);
    }
}
