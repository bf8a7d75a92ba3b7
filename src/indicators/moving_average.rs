/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential Moving Average series, one value per input price
///
/// Seeded with the first price: `ema[0] = prices[0]`, then
/// `ema[i] = prices[i] * k + ema[i-1] * (1 - k)` with `k = 2 / (period + 1)`.
/// Needs roughly 3x `period` values to converge away from the seed.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = prices.first() else {
        return Vec::new();
    };

    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(prices.len());
    out.push(first);
    for price in &prices[1..] {
        let prev = out[out.len() - 1];
        out.push(price * k + prev * (1.0 - k));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let sma = calculate_sma(&prices, 5);
        assert!(sma.is_none());
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        let ema = ema_series(&[10.0, 20.0, 20.0], 3);
        // k = 0.5
        assert_eq!(ema, vec![10.0, 15.0, 17.5]);
    }

    #[test]
    fn test_ema_empty() {
        assert!(ema_series(&[], 20).is_empty());
    }

    #[test]
    fn test_ema_follows_trend() {
        let prices: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let ema = ema_series(&prices, 10);
        assert_eq!(ema.len(), prices.len());
        assert!(ema[49] > ema[41]);
        assert!(ema[49] < prices[49]);
    }
}
