use super::{EntryPlan, EntryPlanner};
use crate::config::StrategySettings;
use crate::indicators::{bollinger_bands, ema_series};
use crate::models::Direction;

/// Direction of the slow trend EMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
}

/// Trend at `idx`: slow EMA now vs `trend_lookback` bars ago
///
/// The EMA runs over at most 3x its period of history ending at `idx`, which
/// is enough for it to converge from its seed. Equal values mean no trend.
pub fn trend_at(closes: &[f64], idx: usize, settings: &StrategySettings) -> Option<Trend> {
    if idx >= closes.len() {
        return None;
    }
    let start = idx.saturating_sub(settings.trend_ema_period * 3);
    let ema = ema_series(&closes[start..=idx], settings.trend_ema_period);
    if ema.len() < settings.trend_lookback + 1 {
        return None;
    }

    let now = ema[ema.len() - 1];
    let then = ema[ema.len() - 1 - settings.trend_lookback];
    if now > then {
        Some(Trend::Up)
    } else if now < then {
        Some(Trend::Down)
    } else {
        None
    }
}

/// Bars of history needed before a signal can be evaluated
pub fn min_bars(settings: &StrategySettings) -> usize {
    (settings.bb_period + 1).max(settings.trend_ema_period + settings.trend_lookback + 1)
}

/// Bollinger breakout at bar `idx`
///
/// LONG when the close breaks above the upper band in an up trend, SHORT when
/// it breaks below the lower band in a down trend. Bands come from the bars
/// before `idx`.
pub fn detect_signal(closes: &[f64], idx: usize, settings: &StrategySettings) -> Option<Direction> {
    if idx < min_bars(settings) || idx >= closes.len() {
        return None;
    }

    let bands = bollinger_bands(closes, idx, settings.bb_period, settings.bb_multiplier)?;
    let close = closes[idx];

    match trend_at(closes, idx, settings)? {
        Trend::Up if close > bands.upper => Some(Direction::Long),
        Trend::Down if close < bands.lower => Some(Direction::Short),
        _ => None,
    }
}

/// Places a resting entry trigger at the band the trend points to
///
/// Up trend: buy trigger at the upper band with a limit 0.1% above it.
/// Down trend: sell trigger at the lower band with a limit 0.1% below it.
/// No trigger when the band is already within 0.1% of the last close.
#[derive(Debug, Clone)]
pub struct BollingerBreakout {
    settings: StrategySettings,
}

impl BollingerBreakout {
    pub fn new(settings: StrategySettings) -> Self {
        Self { settings }
    }
}

impl Default for BollingerBreakout {
    fn default() -> Self {
        Self::new(StrategySettings::default())
    }
}

impl EntryPlanner for BollingerBreakout {
    fn plan(&self, closes: &[f64]) -> Option<EntryPlan> {
        let idx = closes.len().checked_sub(1)?;
        let bands = bollinger_bands(closes, idx, self.settings.bb_period, self.settings.bb_multiplier);
        let Some(bands) = bands else {
            tracing::info!("no bands (flat market or short history)");
            return None;
        };
        let price = closes[idx];
        let trend = trend_at(closes, idx, &self.settings);

        tracing::info!(
            upper = format!("{:.2}", bands.upper),
            middle = format!("{:.2}", bands.middle),
            lower = format!("{:.2}", bands.lower),
            price = format!("{:.2}", price),
            trend = ?trend,
            "bands"
        );

        match trend? {
            Trend::Up if bands.upper > price * 1.001 => Some(EntryPlan {
                direction: Direction::Long,
                trigger_px: bands.upper,
                order_px: bands.upper * 1.001,
            }),
            Trend::Down if bands.lower < price * 0.999 => Some(EntryPlan {
                direction: Direction::Short,
                trigger_px: bands.lower,
                order_px: bands.lower * 0.999,
            }),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        "BollingerBreakout"
    }

    fn min_candles(&self) -> usize {
        min_bars(&self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StrategySettings {
        StrategySettings {
            bb_period: 20,
            bb_multiplier: 2.5,
            trend_ema_period: 24,
            trend_lookback: 4,
            ..StrategySettings::default()
        }
    }

    /// Zig-zag around a line with the given slope
    fn zigzag(n: usize, slope: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 2 == 0 { 5.0 } else { -5.0 };
                2000.0 + slope * i as f64 + wiggle
            })
            .collect()
    }

    #[test]
    fn test_trend_direction() {
        let s = settings();
        let up = zigzag(120, 1.0);
        assert_eq!(trend_at(&up, 119, &s), Some(Trend::Up));
        let down = zigzag(120, -1.0);
        assert_eq!(trend_at(&down, 119, &s), Some(Trend::Down));
        let flat = vec![2000.0; 120];
        assert_eq!(trend_at(&flat, 119, &s), None);
    }

    #[test]
    fn test_detect_breakout_long() {
        let s = settings();
        let mut closes = zigzag(120, 1.0);
        let last = closes[119];
        closes.push(last + 60.0);
        assert_eq!(detect_signal(&closes, 120, &s), Some(Direction::Long));
        // no breakout inside the bands
        assert_eq!(detect_signal(&closes, 119, &s), None);
    }

    #[test]
    fn test_detect_breakout_short() {
        let s = settings();
        let mut closes = zigzag(120, -1.0);
        let last = closes[119];
        closes.push(last - 60.0);
        assert_eq!(detect_signal(&closes, 120, &s), Some(Direction::Short));
    }

    #[test]
    fn test_counter_trend_break_is_ignored() {
        let s = StrategySettings {
            trend_lookback: 8,
            ..settings()
        };
        let mut closes = zigzag(120, 1.0);
        let last = closes[119];
        // just under the lower band, not enough to turn the slow EMA
        closes.push(last - 26.0);
        assert_eq!(trend_at(&closes, 120, &s), Some(Trend::Up));
        assert_eq!(detect_signal(&closes, 120, &s), None);
    }

    #[test]
    fn test_detect_needs_history() {
        let s = settings();
        let closes = zigzag(20, 1.0);
        assert_eq!(detect_signal(&closes, 19, &s), None);
    }

    #[test]
    fn test_plan_long_in_up_trend() {
        let planner = BollingerBreakout::new(settings());
        let closes = zigzag(120, 0.1);
        let plan = planner.plan(&closes).unwrap();

        assert_eq!(plan.direction, Direction::Long);
        assert!(plan.trigger_px > closes[119] * 1.001);
        assert!((plan.order_px - plan.trigger_px * 1.001).abs() < 1e-9);
    }

    #[test]
    fn test_plan_short_in_down_trend() {
        let planner = BollingerBreakout::new(settings());
        let closes = zigzag(120, -0.1);
        let plan = planner.plan(&closes).unwrap();

        assert_eq!(plan.direction, Direction::Short);
        assert!(plan.trigger_px < closes[119] * 0.999);
        assert!((plan.order_px - plan.trigger_px * 0.999).abs() < 1e-9);
    }

    #[test]
    fn test_no_plan_in_flat_market() {
        let planner = BollingerBreakout::new(settings());
        assert!(planner.plan(&vec![2000.0; 120]).is_none());
        assert!(planner.plan(&[]).is_none());
    }
}
