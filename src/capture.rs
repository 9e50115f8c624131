//! Session capture: turns one region-open transition into at most one
//! persisted Session plus its instrument snapshots.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::calendar::Region;
use crate::config::Config;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::quotes::{Quote, QuoteSource};
use crate::registry::Registry;
use crate::retry::{retry_async, RetryConfig};
use crate::session::{entry_levels, risk_ticks, EntrySide, Outcome, Session, SnapshotRow, TOTAL_SYMBOL};
use crate::signal::{score_composite, Classifier, CompositeBands};
use crate::store::{lock_store, SharedStore};

/// Capture a session for a region that just opened. Returns None when the
/// capture was skipped (already captured today, or operator-disabled);
/// the persisted Session otherwise. A failed snapshot fetch records an
/// audit row and errors out without persisting anything.
pub async fn capture_open(
    cfg: &Config,
    registry: &Registry,
    classifier: &mut Classifier,
    region: &Region,
    quotes: &dyn QuoteSource,
    store: &SharedStore,
    opened_at: i64,
) -> Result<Option<Session>> {
    let trade_day = region.trade_day(opened_at);

    // Duplicate open events (retries, restarts) must never create a second
    // session for the same region-day.
    if lock_store(store).session_exists(&region.id, &trade_day)? {
        log(
            Level::Info,
            Domain::Capture,
            "already_captured",
            obj(&[("region", v_str(&region.id)), ("trade_day", v_str(&trade_day))]),
        );
        return Ok(None);
    }

    // Operator controls, not errors.
    if !region.capture_enabled || !region.open_capture_enabled {
        log(
            Level::Debug,
            Domain::Capture,
            "capture_disabled",
            obj(&[("region", v_str(&region.id))]),
        );
        return Ok(None);
    }

    let quote_map = match fetch_snapshot(cfg, registry, quotes).await {
        Ok(map) => map,
        Err(e) => {
            lock_store(store).record_capture_failure(&region.id, opened_at, &e.to_string())?;
            log(
                Level::Error,
                Domain::Capture,
                "snapshot_failed",
                obj(&[("region", v_str(&region.id)), ("error", v_str(&e.to_string()))]),
            );
            return Err(e).context("snapshot fetch exhausted");
        }
    };

    let mut snapshot_rows: Vec<SnapshotRow> = Vec::with_capacity(registry.tracked().len() + 1);
    let mut classifications = Vec::with_capacity(registry.tracked().len());
    for inst in registry.tracked() {
        let quote = &quote_map[&inst.symbol];
        let classification = classifier.classify(registry, &inst.symbol, quote.net_change());
        snapshot_rows.push(SnapshotRow {
            symbol: inst.symbol.clone(),
            bid: Some(quote.bid),
            ask: Some(quote.ask),
            last: Some(quote.last),
            spread: Some(quote.spread()),
            signal: classification.signal,
            signal_weight: classification.signal_weight,
            stat_value: classification.stat_value,
            theo_entry: None,
            theo_target: None,
            theo_stop: None,
            theo_outcome: None,
        });
        classifications.push(classification);
    }

    let bands = CompositeBands { weak: cfg.composite_weak, strong: cfg.composite_strong };
    let (composite_signal, composite_score) = score_composite(&classifications, bands);
    let entry_side = EntrySide::from_composite(composite_signal);

    // Theoretical levels per instrument, direction taken from the composite.
    if entry_side != EntrySide::None {
        for row in snapshot_rows.iter_mut() {
            let Some(inst) = registry.get(&row.symbol) else { continue };
            let n_ticks = risk_ticks(cfg.fixed_dollar_risk, inst.tick_value);
            if let (Some(bid), Some(ask)) = (row.bid, row.ask) {
                if let Some((entry, target, stop)) = entry_levels(entry_side, bid, ask, n_ticks, inst.tick_size) {
                    row.theo_entry = Some(entry);
                    row.theo_target = Some(target);
                    row.theo_stop = Some(stop);
                }
            }
        }
    }

    snapshot_rows.push(SnapshotRow {
        symbol: TOTAL_SYMBOL.to_string(),
        bid: None,
        ask: None,
        last: None,
        spread: None,
        signal: Some(composite_signal),
        signal_weight: 0,
        stat_value: composite_score,
        theo_entry: None,
        theo_target: None,
        theo_stop: None,
        theo_outcome: None,
    });

    let session = build_session(cfg, registry, region, &trade_day, opened_at, composite_signal, composite_score, &quote_map);

    let inserted = lock_store(store).insert_session(&session, &snapshot_rows)?;
    let Some(session_id) = inserted else {
        // Lost a race with a concurrent duplicate event; the constraint is
        // the final arbiter.
        log(
            Level::Info,
            Domain::Capture,
            "already_captured",
            obj(&[("region", v_str(&region.id)), ("trade_day", v_str(&trade_day))]),
        );
        return Ok(None);
    };

    let session = Session { id: session_id, ..session };
    log(
        Level::Info,
        Domain::Capture,
        "session_captured",
        obj(&[
            ("region", v_str(&region.id)),
            ("trade_day", v_str(&trade_day)),
            ("composite", v_str(session.composite_signal.as_str())),
            ("score", v_num(session.composite_score)),
            ("side", v_str(session.entry_side.as_str())),
            ("entry", v_num(session.entry_price.unwrap_or(0.0))),
            ("snapshots", v_num(snapshot_rows.len() as f64)),
        ]),
    );
    Ok(Some(session))
}

/// One consistent set of quotes for the whole universe. Any instrument
/// that stays unreadable through the backoff schedule fails the set.
async fn fetch_snapshot(cfg: &Config, registry: &Registry, quotes: &dyn QuoteSource) -> Result<HashMap<String, Quote>> {
    let retry = RetryConfig::new(cfg.capture_max_retries, cfg.capture_backoff_ms);
    let mut map = HashMap::with_capacity(registry.tracked().len());
    for inst in registry.tracked() {
        let symbol = inst.symbol.clone();
        let quote = retry_async(&retry, &format!("quote:{}", symbol), || quotes.latest(&symbol)).await?;
        map.insert(symbol, quote);
    }
    Ok(map)
}

fn build_session(
    cfg: &Config,
    registry: &Registry,
    region: &Region,
    trade_day: &str,
    opened_at: i64,
    composite_signal: crate::signal::Signal,
    composite_score: f64,
    quote_map: &HashMap<String, Quote>,
) -> Session {
    let entry_side = EntrySide::from_composite(composite_signal);
    let window = region.evaluation_window_secs.unwrap_or(cfg.evaluation_window_secs);

    let mut session = Session {
        id: 0,
        region_id: region.id.clone(),
        trade_day: trade_day.to_string(),
        symbol: cfg.traded_symbol.clone(),
        opened_at,
        composite_signal,
        composite_score,
        entry_side,
        entry_price: None,
        target_price: None,
        stop_price: None,
        evaluation_window_secs: window,
        outcome: Outcome::NoEntry,
        resolution_price: None,
        resolved_at: None,
        resolution_reason: None,
    };

    if entry_side == EntrySide::None {
        // HOLD is terminal at capture time; no grader ever runs.
        session.resolution_reason = Some("composite HOLD".to_string());
        session.resolved_at = Some(opened_at);
        return session;
    }

    let traded = registry
        .get(&cfg.traded_symbol)
        .cloned()
        .unwrap_or_else(|| crate::registry::fallback_instrument(&cfg.traded_symbol));
    // Frozen at capture: the grader never recomputes these.
    let n_ticks = risk_ticks(cfg.fixed_dollar_risk, traded.tick_value);
    if let Some((entry, target, stop)) = quote_map
        .get(&cfg.traded_symbol)
        .and_then(|quote| entry_levels(entry_side, quote.bid, quote.ask, n_ticks, traded.tick_size))
    {
        session.entry_price = Some(entry);
        session.target_price = Some(target);
        session.stop_price = Some(stop);
        session.outcome = Outcome::Pending;
    } else {
        // No tradable quote for the traded instrument: record the day as
        // NO_ENTRY rather than persisting a half-armed session.
        session.entry_side = EntrySide::None;
        session.resolution_reason = Some("traded instrument quote unavailable".to_string());
        session.resolved_at = Some(opened_at);
    }
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::ScriptedQuoteSource;
    use crate::registry::{Instrument, SignalThresholds};
    use crate::store::{into_shared, SessionStore};

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.traded_symbol = "YM".to_string();
        cfg.fixed_dollar_risk = 100.0;
        cfg.evaluation_window_secs = 3600;
        cfg.capture_max_retries = 0;
        cfg.capture_backoff_ms = 1;
        cfg
    }

    fn test_registry() -> Registry {
        let mk = |symbol: &str, weight: f64| Instrument {
            symbol: symbol.to_string(),
            tick_size: 1.0,
            tick_value: 5.0,
            display_precision: 0,
            is_bear_hedge: false,
            composite_weight: weight,
            thresholds: SignalThresholds::symmetric(100.0),
        };
        Registry::new(vec![mk("YM", 2.0), mk("ES", 2.0)])
    }

    fn test_region(id: &str) -> Region {
        Region {
            id: id.to_string(),
            display_name: id.to_string(),
            utc_offset_minutes: 0,
            is_active: true,
            capture_enabled: true,
            open_capture_enabled: true,
            evaluation_window_secs: None,
        }
    }

    fn shared_store() -> SharedStore {
        let mut store = SessionStore::new(":memory:").unwrap();
        store.init().unwrap();
        into_shared(store)
    }

    fn q(bid: f64, ask: f64, last: f64, prior: Option<f64>) -> Quote {
        Quote { bid, ask, last, prior_close: prior, ts: 1_700_000_000 }
    }

    fn bullish_quotes() -> ScriptedQuoteSource {
        let src = ScriptedQuoteSource::new();
        // Both instruments up modestly: BUY each, sum = 1*2 + 1*2 = 4 -> BUY.
        src.set_constant("YM", q(47380.0, 47388.0, 47385.0, Some(47335.0)));
        src.set_constant("ES", q(5000.0, 5000.25, 5000.0, Some(4990.0)));
        src
    }

    #[tokio::test]
    async fn test_buy_capture_scenario() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();
        let quotes = bullish_quotes();

        let session = capture_open(&cfg, &registry, &mut classifier, &test_region("japan"), &quotes, &store, 1_700_000_000)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.entry_side, EntrySide::Buy);
        assert_eq!(session.entry_price, Some(47388.0));
        assert_eq!(session.target_price, Some(47408.0));
        assert_eq!(session.stop_price, Some(47368.0));
        assert_eq!(session.outcome, Outcome::Pending);

        // Tracked instruments + the TOTAL row.
        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        assert_eq!(snaps.len(), 3);
        let total = snaps.iter().find(|s| s.symbol == TOTAL_SYMBOL).unwrap();
        assert!((total.stat_value - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicate_open_is_idempotent() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();
        let quotes = bullish_quotes();
        let region = test_region("usa");

        let first = capture_open(&cfg, &registry, &mut classifier, &region, &quotes, &store, 1_700_000_000).await.unwrap();
        assert!(first.is_some());
        for _ in 0..3 {
            let again = capture_open(&cfg, &registry, &mut classifier, &region, &quotes, &store, 1_700_000_100).await.unwrap();
            assert!(again.is_none());
        }
        let sessions = lock_store(&store).sessions_filtered(Some("usa"), None, None, None).unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_flag_gate_skips_silently() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();
        let quotes = bullish_quotes();

        let mut region = test_region("japan");
        region.open_capture_enabled = false;
        let out = capture_open(&cfg, &registry, &mut classifier, &region, &quotes, &store, 1_700_000_000).await.unwrap();
        assert!(out.is_none());
        assert!(lock_store(&store).sessions_filtered(None, None, None, None).unwrap().is_empty());
        assert_eq!(lock_store(&store).capture_failure_count("japan").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hold_short_circuit() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();

        let quotes = ScriptedQuoteSource::new();
        // Unchanged prices: HOLD everywhere, sum = 0.
        src_flat(&quotes);

        let session = capture_open(&cfg, &registry, &mut classifier, &test_region("japan"), &quotes, &store, 1_700_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.entry_side, EntrySide::None);
        assert_eq!(session.outcome, Outcome::NoEntry);
        assert_eq!(session.entry_price, None);
        assert_eq!(session.target_price, None);
        assert_eq!(session.stop_price, None);

        // Theoretical levels are also absent without a composite direction.
        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        assert!(snaps.iter().all(|s| s.theo_entry.is_none()));
    }

    fn src_flat(src: &ScriptedQuoteSource) {
        src.set_constant("YM", q(47380.0, 47388.0, 47385.0, Some(47385.0)));
        src.set_constant("ES", q(5000.0, 5000.25, 5000.0, Some(5000.0)));
    }

    #[tokio::test]
    async fn test_fetch_failure_records_audit_and_aborts() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();

        // ES has no script: its fetch fails and the whole capture aborts.
        let quotes = ScriptedQuoteSource::new();
        quotes.set_constant("YM", q(47380.0, 47388.0, 47385.0, Some(47335.0)));

        let result = capture_open(&cfg, &registry, &mut classifier, &test_region("japan"), &quotes, &store, 1_700_000_000).await;
        assert!(result.is_err());
        assert_eq!(lock_store(&store).capture_failure_count("japan").unwrap(), 1);
        assert!(lock_store(&store).sessions_filtered(None, None, None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_baseline_still_captures() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();

        let quotes = ScriptedQuoteSource::new();
        quotes.set_constant("YM", q(47380.0, 47388.0, 47385.0, None));
        quotes.set_constant("ES", q(5000.0, 5000.25, 5000.0, Some(4990.0)));

        let session = capture_open(&cfg, &registry, &mut classifier, &test_region("japan"), &quotes, &store, 1_700_000_000)
            .await
            .unwrap()
            .unwrap();
        // YM contributes nothing; ES alone is BUY * 2.0 = 2 -> HOLD band.
        assert_eq!(session.entry_side, EntrySide::None);

        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        let ym = snaps.iter().find(|s| s.symbol == "YM").unwrap();
        assert_eq!(ym.signal, None);
        assert_eq!(ym.signal_weight, 0);
    }

    #[tokio::test]
    async fn test_sell_capture_levels() {
        let cfg = test_cfg();
        let registry = test_registry();
        let store = shared_store();
        let mut classifier = Classifier::new();

        let quotes = ScriptedQuoteSource::new();
        quotes.set_constant("YM", q(47380.0, 47388.0, 47300.0, Some(47350.0)));
        quotes.set_constant("ES", q(5000.0, 5000.25, 4990.0, Some(4998.0)));

        let session = capture_open(&cfg, &registry, &mut classifier, &test_region("japan"), &quotes, &store, 1_700_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.entry_side, EntrySide::Sell);
        // SELL enters at the bid; target below, stop above.
        assert_eq!(session.entry_price, Some(47380.0));
        assert_eq!(session.target_price, Some(47360.0));
        assert_eq!(session.stop_price, Some(47400.0));
    }
}
