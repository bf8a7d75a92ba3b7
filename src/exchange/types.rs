use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::lenient::{bool_lenient, f64_lenient, opt_f64_lenient, opt_string};
use crate::models::{Candle, Direction};

/// Response envelope shared by every REST endpoint
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Per-order acknowledgement, carries its own status code
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAckRow {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub algo_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    #[serde(default)]
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

/// Identifier of a newly placed order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// `ordId` for plain orders, `algoId` for algo orders
    pub id: String,
    pub client_id: String,
}

/// Algo order types queried by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgoKind {
    /// Entry trigger (becomes a limit order when crossed)
    Trigger,
    /// Stop-loss / take-profit attached to a position
    Conditional,
}

impl AlgoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlgoKind::Trigger => "trigger",
            AlgoKind::Conditional => "conditional",
        }
    }
}

/// A position as the exchange reports it
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExchangePosition {
    #[serde(default)]
    pub inst_id: String,
    /// Signed size in contracts (negative is short in net mode)
    #[serde(default, deserialize_with = "f64_lenient")]
    pub pos: f64,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub avg_px: f64,
    /// Creation time, epoch millis
    #[serde(default, deserialize_with = "opt_f64_lenient")]
    pub c_time: Option<f64>,
}

impl ExchangePosition {
    pub fn is_open(&self) -> bool {
        self.pos != 0.0
    }

    pub fn size(&self) -> f64 {
        self.pos.abs()
    }

    pub fn direction(&self) -> Direction {
        match self.pos_side.as_str() {
            "long" => Direction::Long,
            "short" => Direction::Short,
            _ if self.pos < 0.0 => Direction::Short,
            _ => Direction::Long,
        }
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.c_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
    }
}

/// First open position in a list, if any
pub fn open_position(positions: &[ExchangePosition]) -> Option<&ExchangePosition> {
    positions.iter().find(|p| p.is_open())
}

/// A live or historical algo order
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrder {
    pub algo_id: String,
    #[serde(default)]
    pub inst_id: String,
    #[serde(default)]
    pub ord_type: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub sz: f64,
    #[serde(default, deserialize_with = "opt_f64_lenient")]
    pub trigger_px: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_lenient")]
    pub sl_trigger_px: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_lenient")]
    pub tp_trigger_px: Option<f64>,
}

impl AlgoOrder {
    /// Carries a stop-loss leg
    pub fn is_stop_loss(&self) -> bool {
        self.sl_trigger_px.is_some()
    }
}

/// A resting plain order
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub ord_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub ord_type: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub px: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub sz: f64,
    #[serde(default, deserialize_with = "bool_lenient")]
    pub reduce_only: bool,
    #[serde(default)]
    pub state: String,
}

/// Details of a single order
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub ord_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub avg_px: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub acc_fill_sz: f64,
}

/// One execution
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub fill_px: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub fill_sz: f64,
    #[serde(default, deserialize_with = "opt_string")]
    pub ts: Option<String>,
}

/// Contract details for the traded instrument
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub inst_id: String,
    /// Underlying per contract
    #[serde(default, deserialize_with = "f64_lenient")]
    pub ct_val: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub lot_sz: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub min_sz: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub tick_sz: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    #[serde(default)]
    pub inst_id: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub last: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub bid_px: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub ask_px: f64,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub vol24h: f64,
}

/// Account summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub usdt_available: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BalanceRow {
    #[serde(default, deserialize_with = "f64_lenient")]
    pub total_eq: f64,
    #[serde(default)]
    pub details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BalanceDetail {
    #[serde(default)]
    pub ccy: String,
    #[serde(default, deserialize_with = "f64_lenient")]
    pub avail_bal: f64,
}

impl From<BalanceRow> for AccountBalance {
    fn from(row: BalanceRow) -> Self {
        let usdt_available = row
            .details
            .iter()
            .find(|d| d.ccy == "USDT")
            .map(|d| d.avail_bal)
            .unwrap_or(0.0);
        Self {
            total_equity: row.total_eq,
            usdt_available,
        }
    }
}

/// Parse a candle row `[ts, o, h, l, c, vol, ..., confirm]`
///
/// Returns the candle and whether the bar is closed (confirm flag "1").
/// Rows without a confirm column count as closed.
pub fn parse_candle_row(row: &[String]) -> Option<(Candle, bool)> {
    if row.len() < 6 {
        return None;
    }
    let ts_ms: i64 = row[0].parse().ok()?;
    let num = |i: usize| row[i].parse::<f64>().ok();
    let candle = Candle {
        timestamp: Utc.timestamp_millis_opt(ts_ms).single()?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    };
    let confirmed = row.get(8).map(|c| c == "1").unwrap_or(true);
    Some((candle, confirmed))
}
