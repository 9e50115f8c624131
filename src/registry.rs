//! Instrument reference data: tick economics, classification thresholds,
//! composite weights. Seeded once at startup and read-only afterwards.

use std::collections::HashMap;

/// Band edges for classifying a net price change. `buy_above` and
/// `sell_below` default to zero, making HOLD the inclusive band around
/// an unchanged price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    pub strong_buy_above: f64,
    pub buy_above: f64,
    pub sell_below: f64,
    pub strong_sell_below: f64,
}

impl SignalThresholds {
    pub fn symmetric(strong: f64) -> Self {
        Self {
            strong_buy_above: strong,
            buy_above: 0.0,
            sell_below: 0.0,
            strong_sell_below: -strong,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: f64,
    pub tick_value: f64,
    pub display_precision: u32,
    /// Price-up means risk-off for the broad market (gold, bonds).
    pub is_bear_hedge: bool,
    pub composite_weight: f64,
    pub thresholds: SignalThresholds,
}

pub struct Registry {
    instruments: Vec<Instrument>,
    by_symbol: HashMap<String, usize>,
}

impl Registry {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let by_symbol = instruments
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.symbol.clone(), i))
            .collect();
        Self { instruments, by_symbol }
    }

    /// The tracked universe: US equity-index futures plus bear hedges.
    pub fn default_set() -> Self {
        let mk = |symbol: &str, tick_size: f64, tick_value: f64, precision: u32, bear: bool, weight: f64, strong: f64| Instrument {
            symbol: symbol.to_string(),
            tick_size,
            tick_value,
            display_precision: precision,
            is_bear_hedge: bear,
            composite_weight: weight,
            thresholds: SignalThresholds::symmetric(strong),
        };
        Self::new(vec![
            mk("YM", 1.0, 5.0, 0, false, 1.0, 100.0),
            mk("ES", 0.25, 12.5, 2, false, 1.5, 12.0),
            mk("NQ", 0.25, 5.0, 2, false, 1.25, 50.0),
            mk("RTY", 0.1, 5.0, 1, false, 1.0, 10.0),
            mk("CL", 0.01, 10.0, 2, false, 0.5, 0.75),
            mk("6E", 0.00005, 6.25, 5, false, 0.5, 0.005),
            mk("GC", 0.1, 10.0, 1, true, 1.0, 15.0),
            mk("ZB", 0.03125, 31.25, 5, true, 1.0, 0.5),
        ])
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.by_symbol.get(symbol).map(|&i| &self.instruments[i])
    }

    pub fn tracked(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.symbol.clone()).collect()
    }
}

/// Fallback reference data for symbols missing from the registry. A gap
/// here is a configuration problem, not a capture-fatal one.
pub fn fallback_instrument(symbol: &str) -> Instrument {
    Instrument {
        symbol: symbol.to_string(),
        tick_size: 1.0,
        tick_value: 5.0,
        display_precision: 2,
        is_bear_hedge: false,
        composite_weight: 1.0,
        thresholds: SignalThresholds::symmetric(100.0),
    }
}
