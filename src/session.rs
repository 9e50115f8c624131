//! Session domain types and the fixed-risk tick math.
//!
//! A Session is one capture-and-grade lifecycle for one region on one
//! trading day. Its outcome only ever moves PENDING -> terminal.

use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySide {
    Buy,
    Sell,
    None,
}

impl EntrySide {
    pub fn as_str(self) -> &'static str {
        match self {
            EntrySide::Buy => "BUY",
            EntrySide::Sell => "SELL",
            EntrySide::None => "NONE",
        }
    }

    pub fn parse(s: &str) -> Option<EntrySide> {
        match s {
            "BUY" => Some(EntrySide::Buy),
            "SELL" => Some(EntrySide::Sell),
            "NONE" => Some(EntrySide::None),
            _ => None,
        }
    }

    pub fn from_composite(signal: Signal) -> EntrySide {
        if signal.is_bullish() {
            EntrySide::Buy
        } else if signal.is_bearish() {
            EntrySide::Sell
        } else {
            EntrySide::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Worked,
    DidntWork,
    Expired,
    NoEntry,
    Error,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pending => "PENDING",
            Outcome::Worked => "WORKED",
            Outcome::DidntWork => "DIDNT_WORK",
            Outcome::Expired => "EXPIRED",
            Outcome::NoEntry => "NO_ENTRY",
            Outcome::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Outcome> {
        match s {
            "PENDING" => Some(Outcome::Pending),
            "WORKED" => Some(Outcome::Worked),
            "DIDNT_WORK" => Some(Outcome::DidntWork),
            "EXPIRED" => Some(Outcome::Expired),
            "NO_ENTRY" => Some(Outcome::NoEntry),
            "ERROR" => Some(Outcome::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    /// Store rowid; 0 until persisted.
    pub id: i64,
    pub region_id: String,
    pub trade_day: String,
    pub symbol: String,
    pub opened_at: i64,
    pub composite_signal: Signal,
    pub composite_score: f64,
    pub entry_side: EntrySide,
    pub entry_price: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub evaluation_window_secs: u64,
    pub outcome: Outcome,
    pub resolution_price: Option<f64>,
    pub resolved_at: Option<i64>,
    pub resolution_reason: Option<String>,
}

impl Session {
    pub fn deadline(&self) -> i64 {
        self.opened_at + self.evaluation_window_secs as i64
    }
}

/// Per-instrument snapshot taken at capture time. The synthetic TOTAL row
/// carries the composite and has no quote fields.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub spread: Option<f64>,
    pub signal: Option<Signal>,
    pub signal_weight: i32,
    pub stat_value: f64,
    pub theo_entry: Option<f64>,
    pub theo_target: Option<f64>,
    pub theo_stop: Option<f64>,
    pub theo_outcome: Option<Outcome>,
}

pub const TOTAL_SYMBOL: &str = "TOTAL";

// =============================================================================
// Tick math
// =============================================================================

/// Ticks of room a fixed dollar risk buys on an instrument. Rounded to the
/// nearest whole tick, never less than one.
pub fn risk_ticks(fixed_dollar_risk: f64, tick_value: f64) -> i64 {
    if tick_value <= 0.0 {
        return 1;
    }
    ((fixed_dollar_risk / tick_value).round() as i64).max(1)
}

/// Entry/target/stop for a directional entry. Target and stop sit the same
/// number of ticks either side of entry.
pub fn entry_levels(side: EntrySide, bid: f64, ask: f64, n_ticks: i64, tick_size: f64) -> Option<(f64, f64, f64)> {
    let offset = n_ticks as f64 * tick_size;
    match side {
        EntrySide::Buy => Some((ask, ask + offset, ask - offset)),
        EntrySide::Sell => Some((bid, bid - offset, bid + offset)),
        EntrySide::None => None,
    }
}

/// First-touch resolution against a single price mark. Target is checked
/// before stop when both are touched within one observation.
pub fn first_touch(side: EntrySide, price: f64, target: f64, stop: f64) -> Option<Outcome> {
    match side {
        EntrySide::Buy => {
            if price >= target {
                Some(Outcome::Worked)
            } else if price <= stop {
                Some(Outcome::DidntWork)
            } else {
                None
            }
        }
        EntrySide::Sell => {
            if price <= target {
                Some(Outcome::Worked)
            } else if price >= stop {
                Some(Outcome::DidntWork)
            } else {
                None
            }
        }
        EntrySide::None => None,
    }
}
