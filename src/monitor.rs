//! Per-region auxiliary workers: intraday high/low/close/range while the
//! market is open, and the rolling 52-week extrema band.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::calendar::Region;
use crate::config::now_ts;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::quotes::QuoteSource;
use crate::store::{lock_store, SharedStore};

#[derive(Debug, Clone, Copy)]
pub struct IntradayTracker {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl IntradayTracker {
    pub fn new(price: f64) -> Self {
        Self { high: price, low: price, close: price }
    }

    pub fn update(&mut self, price: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Runs while one region's market is open. Cancelled by the coordinator on
/// the close transition; final intraday rows are flushed on the way out.
pub async fn run_region_monitor(
    region: Region,
    symbols: Vec<String>,
    quotes: Arc<dyn QuoteSource>,
    store: SharedStore,
    cancel: watch::Receiver<bool>,
    poll: Duration,
) {
    let trade_day = region.trade_day(now_ts());
    let mut trackers: HashMap<String, IntradayTracker> = HashMap::new();
    let mut extremes: HashMap<String, (f64, f64)> = HashMap::new();
    let mut cancel = cancel;

    log(
        Level::Info,
        Domain::Monitor,
        "monitor_started",
        obj(&[("region", v_str(&region.id)), ("trade_day", v_str(&trade_day))]),
    );

    loop {
        if *cancel.borrow() {
            finalize(&region, &trade_day, &trackers, &store);
            return;
        }

        for symbol in &symbols {
            let quote = match quotes.latest(symbol).await {
                Ok(q) => q,
                // Monitors are best-effort; a dark symbol just skips a tick.
                Err(_) => continue,
            };
            let mark = quote.last;
            trackers
                .entry(symbol.clone())
                .and_modify(|t| t.update(mark))
                .or_insert_with(|| IntradayTracker::new(mark));

            track_extreme(symbol, mark, &mut extremes, &store);
        }

        tokio::select! {
            _ = sleep(poll) => {}
            _ = cancel.changed() => {}
        }
    }
}

/// Widen the cached and stored 52-week band when a print breaches it.
fn track_extreme(symbol: &str, mark: f64, extremes: &mut HashMap<String, (f64, f64)>, store: &SharedStore) {
    let cached = match extremes.get(symbol) {
        Some(band) => *band,
        None => {
            let stored = lock_store(store).rolling_extreme(symbol).ok().flatten();
            let band = stored.unwrap_or((mark, mark));
            extremes.insert(symbol.to_string(), band);
            band
        }
    };

    let (high, low) = cached;
    if mark > high || mark < low {
        let widened = (high.max(mark), low.min(mark));
        extremes.insert(symbol.to_string(), widened);
        if let Err(e) = lock_store(store).update_rolling_extreme(symbol, widened.0, widened.1, now_ts()) {
            log(
                Level::Warn,
                Domain::Monitor,
                "extreme_write_failed",
                obj(&[("symbol", v_str(symbol)), ("error", v_str(&e.to_string()))]),
            );
        } else {
            log(
                Level::Info,
                Domain::Monitor,
                "rolling_extreme",
                obj(&[
                    ("symbol", v_str(symbol)),
                    ("high_52w", v_num(widened.0)),
                    ("low_52w", v_num(widened.1)),
                ]),
            );
        }
    }
}

fn finalize(region: &Region, trade_day: &str, trackers: &HashMap<String, IntradayTracker>, store: &SharedStore) {
    let mut guard = lock_store(store);
    for (symbol, tracker) in trackers {
        if let Err(e) = guard.write_intraday_stat(&region.id, trade_day, symbol, tracker.high, tracker.low, tracker.close) {
            log(
                Level::Error,
                Domain::Monitor,
                "finalize_failed",
                obj(&[
                    ("region", v_str(&region.id)),
                    ("symbol", v_str(symbol)),
                    ("error", v_str(&e.to_string())),
                ]),
            );
        }
    }
    drop(guard);
    log(
        Level::Info,
        Domain::Monitor,
        "monitor_finalized",
        obj(&[
            ("region", v_str(&region.id)),
            ("trade_day", v_str(trade_day)),
            ("instruments", v_num(trackers.len() as f64)),
        ]),
    );
}
