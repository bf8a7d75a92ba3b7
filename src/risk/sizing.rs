use crate::config::RiskSettings;
use crate::exchange::Instrument;
use crate::models::Direction;

/// Contracts to open for one entry
///
/// `notional = equity * position_ratio`, capped so that a stop-out costs at
/// most `max_single_loss`. The contract count is floored to the lot size.
/// Returns `None` when equity or price is unusable or the result is below the
/// instrument minimum.
pub fn contracts_for(equity: f64, price: f64, instrument: &Instrument, risk: &RiskSettings) -> Option<f64> {
    if equity <= 0.0 || price <= 0.0 || instrument.ct_val <= 0.0 || instrument.lot_sz <= 0.0 {
        return None;
    }

    let mut notional = equity * risk.position_ratio;
    if notional * risk.stop_loss_pct > risk.max_single_loss {
        notional = risk.max_single_loss / risk.stop_loss_pct;
    }

    let raw = notional / (instrument.ct_val * price);
    // small epsilon so 1.4999999999 lots still counts as 1.5
    let lots = (raw / instrument.lot_sz + 1e-9).floor();
    let contracts = round_to_step(lots * instrument.lot_sz, instrument.lot_sz);

    tracing::info!(
        equity = format!("{:.2}", equity),
        notional = format!("{:.2}", notional),
        contracts,
        ct_val = instrument.ct_val,
        lot_sz = instrument.lot_sz,
        "position sizing"
    );

    if contracts < instrument.min_sz || contracts <= 0.0 {
        tracing::warn!(contracts, min_sz = instrument.min_sz, "size below instrument minimum, no entry");
        return None;
    }
    Some(contracts)
}

/// Stop-loss and take-profit prices for an entry
pub fn protective_levels(direction: Direction, entry_price: f64, risk: &RiskSettings) -> (f64, f64) {
    match direction {
        Direction::Long => (
            entry_price * (1.0 - risk.stop_loss_pct),
            entry_price * (1.0 + risk.take_profit_pct),
        ),
        Direction::Short => (
            entry_price * (1.0 + risk.stop_loss_pct),
            entry_price * (1.0 - risk.take_profit_pct),
        ),
    }
}

/// Round to the decimal precision of `step` (0.01 -> 2 places)
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step.is_nan() || step <= 0.0 {
        return value;
    }
    let decimals = (-step.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_swap() -> Instrument {
        Instrument {
            inst_id: "ETH-USDT-SWAP".to_string(),
            ct_val: 0.1,
            lot_sz: 0.01,
            min_sz: 0.01,
            tick_sz: 0.01,
        }
    }

    #[test]
    fn test_size_from_equity_ratio() {
        // 1000 * 0.30 = 300 notional, stop-out 6 < 10
        let size = contracts_for(1000.0, 2000.0, &eth_swap(), &RiskSettings::default());
        assert_eq!(size, Some(1.5));
    }

    #[test]
    fn test_size_capped_by_max_single_loss() {
        // 10000 * 0.30 = 3000, stop-out 60 > 10 -> notional 500
        let size = contracts_for(10_000.0, 2000.0, &eth_swap(), &RiskSettings::default());
        assert_eq!(size, Some(2.5));
    }

    #[test]
    fn test_size_floored_to_lot() {
        // 300 / (0.1 * 1944.52) = 1.5428...
        let size = contracts_for(1000.0, 1944.52, &eth_swap(), &RiskSettings::default());
        assert_eq!(size, Some(1.54));
    }

    #[test]
    fn test_below_minimum_means_no_entry() {
        let mut inst = eth_swap();
        inst.min_sz = 1.0;
        inst.lot_sz = 1.0;
        assert_eq!(contracts_for(10.0, 2000.0, &inst, &RiskSettings::default()), None);
        assert_eq!(contracts_for(0.0, 2000.0, &eth_swap(), &RiskSettings::default()), None);
        assert_eq!(contracts_for(1000.0, 0.0, &eth_swap(), &RiskSettings::default()), None);
    }

    #[test]
    fn test_protective_levels() {
        let risk = RiskSettings::default();
        let (sl, tp) = protective_levels(Direction::Long, 2000.0, &risk);
        assert!((sl - 1960.0).abs() < 1e-9);
        assert!((tp - 2060.0).abs() < 1e-9);

        let (sl, tp) = protective_levels(Direction::Short, 2000.0, &risk);
        assert!((sl - 2040.0).abs() < 1e-9);
        assert!((tp - 1940.0).abs() < 1e-9);
    }
}
