//! Per-instrument signal classification and composite scoring.
//!
//! Classification is a pure function of an instrument's static thresholds
//! and a net price change; the composite is a weighted sum over one
//! classification per instrument.

use std::collections::HashMap;

use crate::registry::{fallback_instrument, Registry, SignalThresholds};
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Signal {
    /// Global weight table: STRONG_BUY=+2 .. STRONG_SELL=-2.
    pub fn weight(self) -> i32 {
        match self {
            Signal::StrongBuy => 2,
            Signal::Buy => 1,
            Signal::Hold => 0,
            Signal::Sell => -1,
            Signal::StrongSell => -2,
        }
    }

    pub fn inverted(self) -> Signal {
        match self {
            Signal::StrongBuy => Signal::StrongSell,
            Signal::Buy => Signal::Sell,
            Signal::Hold => Signal::Hold,
            Signal::Sell => Signal::Buy,
            Signal::StrongSell => Signal::StrongBuy,
        }
    }

    pub fn is_bullish(self) -> bool {
        matches!(self, Signal::Buy | Signal::StrongBuy)
    }

    pub fn is_bearish(self) -> bool {
        matches!(self, Signal::Sell | Signal::StrongSell)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::StrongBuy => "STRONG_BUY",
            Signal::Buy => "BUY",
            Signal::Hold => "HOLD",
            Signal::Sell => "SELL",
            Signal::StrongSell => "STRONG_SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Signal> {
        match s {
            "STRONG_BUY" => Some(Signal::StrongBuy),
            "BUY" => Some(Signal::Buy),
            "HOLD" => Some(Signal::Hold),
            "SELL" => Some(Signal::Sell),
            "STRONG_SELL" => Some(Signal::StrongSell),
            _ => None,
        }
    }
}

/// One classified instrument row, ready for composite aggregation.
#[derive(Debug, Clone)]
pub struct Classification {
    pub symbol: String,
    /// None when price data was missing or unparsable (no-op row).
    pub signal: Option<Signal>,
    pub stat_value: f64,
    /// Effective weight after bear-hedge inversion.
    pub signal_weight: i32,
    pub composite_weight: f64,
}

/// Classify a net change against an instrument's band cascade.
/// HOLD is the inclusive band between `buy_above` and `sell_below`.
pub fn classify_change(change: f64, t: &SignalThresholds) -> Signal {
    if change > t.strong_buy_above {
        Signal::StrongBuy
    } else if change > t.buy_above {
        Signal::Buy
    } else if change >= t.sell_below {
        Signal::Hold
    } else if change > t.strong_sell_below {
        Signal::Sell
    } else {
        Signal::StrongSell
    }
}

/// Classifier with per-symbol threshold memoization. Thresholds are static
/// within a run, so resolution (including the missing-symbol fallback and
/// its warning) happens once per symbol.
pub struct Classifier {
    cache: HashMap<String, CachedRef>,
}

struct CachedRef {
    thresholds: SignalThresholds,
    is_bear_hedge: bool,
    composite_weight: f64,
}

impl Classifier {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    pub fn classify(&mut self, registry: &Registry, symbol: &str, change: Option<f64>) -> Classification {
        let cached = self.cache.entry(symbol.to_string()).or_insert_with(|| {
            match registry.get(symbol) {
                Some(inst) => CachedRef {
                    thresholds: inst.thresholds,
                    is_bear_hedge: inst.is_bear_hedge,
                    composite_weight: inst.composite_weight,
                },
                None => {
                    log(
                        Level::Warn,
                        Domain::Capture,
                        "threshold_fallback",
                        obj(&[("symbol", v_str(symbol))]),
                    );
                    let inst = fallback_instrument(symbol);
                    CachedRef {
                        thresholds: inst.thresholds,
                        is_bear_hedge: inst.is_bear_hedge,
                        composite_weight: inst.composite_weight,
                    }
                }
            }
        });

        let Some(change) = change.filter(|c| c.is_finite()) else {
            return Classification {
                symbol: symbol.to_string(),
                signal: None,
                stat_value: 0.0,
                signal_weight: 0,
                composite_weight: cached.composite_weight,
            };
        };

        let signal = classify_change(change, &cached.thresholds);
        // Hedge instruments contribute the opposite weight; the label stays.
        let effective = if cached.is_bear_hedge { signal.inverted() } else { signal };
        Classification {
            symbol: symbol.to_string(),
            signal: Some(signal),
            stat_value: change,
            signal_weight: effective.weight(),
            composite_weight: cached.composite_weight,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Composite scoring
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct CompositeBands {
    /// |sum| <= weak is HOLD.
    pub weak: f64,
    /// |sum| > strong is STRONG_*.
    pub strong: f64,
}

impl Default for CompositeBands {
    fn default() -> Self {
        Self { weak: 3.0, strong: 9.0 }
    }
}

/// Weighted composite over one classification per instrument. Ties land in
/// the lower-magnitude band: sum == strong is BUY, sum == weak is HOLD.
pub fn score_composite(rows: &[Classification], bands: CompositeBands) -> (Signal, f64) {
    let sum: f64 = rows
        .iter()
        .map(|r| r.signal_weight as f64 * r.composite_weight)
        .sum();

    let signal = if sum > bands.strong {
        Signal::StrongBuy
    } else if sum > bands.weak {
        Signal::Buy
    } else if sum >= -bands.weak {
        Signal::Hold
    } else if sum >= -bands.strong {
        Signal::Sell
    } else {
        Signal::StrongSell
    };
    (signal, sum)
}
