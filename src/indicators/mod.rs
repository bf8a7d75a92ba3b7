// Technical indicators module
// Pure functions over close prices: moving averages and Bollinger Bands

pub mod bollinger;
pub mod moving_average;

pub use bollinger::{bollinger_bands, Bands};
pub use moving_average::{calculate_sma, ema_series};
