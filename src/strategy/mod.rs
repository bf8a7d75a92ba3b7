// Entry planning: where to rest the next entry trigger
pub mod breakout;

use crate::models::Direction;

pub use breakout::{detect_signal, BollingerBreakout, Trend};

/// A resting entry order to place: trigger price and the limit it becomes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPlan {
    pub direction: Direction,
    pub trigger_px: f64,
    pub order_px: f64,
}

/// Computes the next entry trigger from closed-bar history
///
/// Pure function of its input; the execution engine treats it as a black box.
pub trait EntryPlanner: Send + Sync {
    /// Plan an entry from closes, oldest first. `None` means no trigger this bar.
    fn plan(&self, closes: &[f64]) -> Option<EntryPlan>;

    /// Get planner name
    fn name(&self) -> &str;

    /// Minimum closed bars required for a meaningful plan
    fn min_candles(&self) -> usize;
}
