pub mod lenient;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn close_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Direction of an entry order with the given side
    pub fn from_entry_side(side: OrderSide) -> Direction {
        match side {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Order side as the exchange spells it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<OrderSide> {
        match s {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV candlestick for one closed bar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The single open position the engine manages
///
/// Created once the stop-loss is confirmed live, destroyed when the exchange
/// reports zero size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionDescriptor {
    pub direction: Direction,
    #[serde(deserialize_with = "lenient::f64_lenient")]
    pub entry_price: f64,
    #[serde(deserialize_with = "lenient::f64_lenient")]
    pub size: f64,
    #[serde(deserialize_with = "lenient::f64_lenient")]
    pub sl_price: f64,
    #[serde(alias = "sl_algo_id")]
    pub sl_order_id: String,
    #[serde(deserialize_with = "lenient::f64_lenient")]
    pub tp_price: f64,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub tp_order_id: Option<String>,
    pub entry_time: DateTime<Utc>,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    #[serde(rename = "sl", alias = "SL")]
    StopLoss,
    #[serde(rename = "tp", alias = "TP")]
    TakeProfit,
    #[serde(rename = "timeout", alias = "TIMEOUT")]
    Timeout,
    #[serde(rename = "emergency", alias = "EMERGENCY")]
    Emergency,
    /// Exit could not be attributed with confidence
    ///
    /// Older logs also carry manual and early exits, which this engine never makes.
    #[serde(rename = "unknown", alias = "MANUAL", alias = "EARLY_EXIT")]
    Unknown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "sl",
            ExitReason::TakeProfit => "tp",
            ExitReason::Timeout => "timeout",
            ExitReason::Emergency => "emergency",
            ExitReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A completed round trip, as appended to the trade log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeResult {
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Absent from logs written before sizes were recorded
    #[serde(default)]
    pub size: f64,
    /// Net of entry and exit taker fees
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    #[serde(default)]
    pub hold_minutes: i64,
}

impl TradeResult {
    pub fn from_close(
        position: &PositionDescriptor,
        exit_price: f64,
        exit_reason: ExitReason,
        taker_fee: f64,
        exit_time: DateTime<Utc>,
    ) -> Self {
        let gross = match position.direction {
            Direction::Long => (exit_price - position.entry_price) / position.entry_price,
            Direction::Short => (position.entry_price - exit_price) / position.entry_price,
        };

        Self {
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl_pct: gross - 2.0 * taker_fee,
            exit_reason,
            entry_time: position.entry_time,
            exit_time,
            hold_minutes: (exit_time - position.entry_time).num_minutes(),
        }
    }

    /// Two results describe the same round trip
    pub fn same_trade(&self, other: &TradeResult) -> bool {
        self.direction == other.direction && self.entry_time == other.entry_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn position(direction: Direction) -> PositionDescriptor {
        PositionDescriptor {
            direction,
            entry_price: 2000.0,
            size: 1.0,
            sl_price: 1960.0,
            sl_order_id: "sl-1".to_string(),
            tp_price: 2060.0,
            tp_order_id: Some("tp-1".to_string()),
            entry_time: Utc::now() - Duration::minutes(90),
        }
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Long.close_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.entry_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.close_side(), OrderSide::Buy);
        assert_eq!(Direction::from_entry_side(OrderSide::Sell), Direction::Short);
    }

    #[test]
    fn test_position_json_round_trip() {
        let pos = position(Direction::Short);
        let json = serde_json::to_string(&pos).unwrap();
        let back: PositionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(pos, back);
    }

    #[test]
    fn test_position_reads_previous_schema() {
        let json = r#"{
            "direction": "LONG", "entry_price": 2000.0, "size": "1.00",
            "sl_price": 1960.0, "tp_price": 2060.0, "sl_algo_id": "123",
            "tp_order_id": "", "entry_time": "2025-01-02T03:04:05+00:00",
            "entry_bar_count": 0
        }"#;
        let pos: PositionDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(pos.size, 1.0);
        assert_eq!(pos.sl_order_id, "123");
        assert!(pos.tp_order_id.is_none());
    }

    #[test]
    fn test_trade_pnl_net_of_fees() {
        let long = TradeResult::from_close(
            &position(Direction::Long),
            2060.0,
            ExitReason::TakeProfit,
            0.0005,
            Utc::now(),
        );
        assert!((long.pnl_pct - 0.029).abs() < 1e-9);
        assert!(long.hold_minutes >= 89);

        let short = TradeResult::from_close(
            &position(Direction::Short),
            2060.0,
            ExitReason::StopLoss,
            0.0005,
            Utc::now(),
        );
        assert!((short.pnl_pct + 0.031).abs() < 1e-9);
    }

    #[test]
    fn test_exit_reason_serialization() {
        assert_eq!(serde_json::to_string(&ExitReason::StopLoss).unwrap(), "\"sl\"");
        assert_eq!(ExitReason::Unknown.to_string(), "unknown");
    }
}
