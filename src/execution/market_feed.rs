use crate::models::Candle;
use std::collections::VecDeque;

/// Rolling window of closed candles for the traded instrument
///
/// Seeded once from REST, then fed closed bars from the candle stream.
#[derive(Debug, Clone)]
pub struct MarketDataFeed {
    candles: VecDeque<Candle>,
    max_candles: usize,
    min_candles: usize,
}

impl MarketDataFeed {
    /// Create an empty feed
    ///
    /// # Arguments
    /// * `max_candles` - Oldest bars are dropped beyond this many
    /// * `min_candles` - Bars required before `ready()`
    pub fn new(max_candles: usize, min_candles: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_candles),
            max_candles,
            min_candles,
        }
    }

    /// Replace the window with closed candles, oldest first
    pub fn seed(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        for candle in candles {
            self.push_closed(candle);
        }
    }

    /// Append a closed bar
    ///
    /// Returns false when the bar is not newer than the last one (duplicate
    /// push or replay after reconnect).
    pub fn push_closed(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.timestamp <= last.timestamp {
                return false;
            }
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
        true
    }

    pub fn ready(&self) -> bool {
        self.candles.len() >= self.min_candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Close prices, oldest first
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(minute: i64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute * 30),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_window_is_capped() {
        let mut feed = MarketDataFeed::new(3, 2);
        for i in 0..5 {
            assert!(feed.push_closed(candle(i, i as f64)));
        }
        assert_eq!(feed.len(), 3);
        assert_eq!(feed.closes(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_duplicate_and_stale_bars_ignored() {
        let mut feed = MarketDataFeed::new(10, 1);
        assert!(feed.push_closed(candle(1, 1.0)));
        assert!(!feed.push_closed(candle(1, 1.5)));
        assert!(!feed.push_closed(candle(0, 0.5)));
        assert_eq!(feed.closes(), vec![1.0]);
    }

    #[test]
    fn test_ready_after_min_candles() {
        let mut feed = MarketDataFeed::new(10, 3);
        feed.seed(vec![candle(0, 1.0), candle(1, 2.0)]);
        assert!(!feed.ready());
        feed.push_closed(candle(2, 3.0));
        assert!(feed.ready());
        assert_eq!(feed.last().map(|c| c.close), Some(3.0));
    }
}
