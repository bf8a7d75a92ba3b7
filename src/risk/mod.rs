// Risk management module: position sizing and protective price levels
pub mod sizing;

pub use sizing::{contracts_for, protective_levels, round_to_step};
