use super::moving_average::calculate_sma;

/// Bollinger band levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Bollinger Bands from the `period` closes *before* `idx` (no look-ahead)
///
/// Uses the population standard deviation. Returns `None` when there is not
/// enough history or the window is flat (std < 1e-10).
pub fn bollinger_bands(closes: &[f64], idx: usize, period: usize, multiplier: f64) -> Option<Bands> {
    if period == 0 || idx < period || idx > closes.len() {
        return None;
    }

    let window = &closes[idx - period..idx];
    let middle = calculate_sma(window, period)?;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();

    if std < 1e-10 {
        return None;
    }

    Some(Bands {
        middle,
        upper: middle + multiplier * std,
        lower: middle - multiplier * std,
    })
}
