//! Outcome grading: one cancellable task per PENDING session, polling the
//! live mark until target or stop is touched, the window lapses, or the
//! quote source stays dark too long.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::now_ts;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::quotes::QuoteSource;
use crate::session::{first_touch, Outcome, Session, SnapshotRow, TOTAL_SYMBOL};
use crate::store::{lock_store, SharedStore};

/// Grade one session to its terminal outcome. The session's mutable fields
/// are owned by this task alone; the single terminal write is guarded in
/// the store, so a stale grader can never un-resolve a session.
pub async fn grade_session(
    session: Session,
    quotes: Arc<dyn QuoteSource>,
    store: SharedStore,
    shutdown: watch::Receiver<bool>,
    poll: Duration,
    max_read_failures: u32,
) {
    let (Some(target), Some(stop)) = (session.target_price, session.stop_price) else {
        finish(&store, &session, Outcome::Error, None, now_ts(), "session missing price levels");
        return;
    };

    let deadline = session.deadline();
    let mut failures: u32 = 0;
    let mut shutdown = shutdown;

    loop {
        if *shutdown.borrow() {
            // Leave the row PENDING; a fresh grader reattaches on restart.
            log(
                Level::Info,
                Domain::Grade,
                "grader_detached",
                obj(&[("session_id", v_num(session.id as f64))]),
            );
            return;
        }

        let now = now_ts();
        if now > deadline {
            finish(&store, &session, Outcome::Expired, None, now, "window elapsed without touch");
            return;
        }

        match quotes.latest(&session.symbol).await {
            Ok(quote) => {
                failures = 0;
                let mark = quote.bid;
                if let Some(outcome) = first_touch(session.entry_side, mark, target, stop) {
                    let reason = match outcome {
                        Outcome::Worked => "target touched",
                        _ => "stop touched",
                    };
                    finish(&store, &session, outcome, Some(mark), now_ts(), reason);
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                log(
                    Level::Warn,
                    Domain::Grade,
                    "read_failed",
                    obj(&[
                        ("session_id", v_num(session.id as f64)),
                        ("symbol", v_str(&session.symbol)),
                        ("consecutive", v_num(failures as f64)),
                        ("error", v_str(&e.to_string())),
                    ]),
                );
                if failures > max_read_failures {
                    finish(
                        &store,
                        &session,
                        Outcome::Error,
                        None,
                        now_ts(),
                        &format!("quote source unreadable: {}", e),
                    );
                    return;
                }
            }
        }

        tokio::select! {
            _ = sleep(poll) => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn finish(store: &SharedStore, session: &Session, outcome: Outcome, price: Option<f64>, at: i64, reason: &str) {
    match lock_store(store).resolve_session(session.id, outcome, price, at, reason) {
        Ok(true) => log(
            Level::Info,
            Domain::Grade,
            "session_resolved",
            obj(&[
                ("session_id", v_num(session.id as f64)),
                ("region", v_str(&session.region_id)),
                ("outcome", v_str(outcome.as_str())),
                ("price", price.map(v_num).unwrap_or(serde_json::Value::Null)),
                ("reason", v_str(reason)),
            ]),
        ),
        Ok(false) => log(
            Level::Warn,
            Domain::Grade,
            "already_terminal",
            obj(&[("session_id", v_num(session.id as f64))]),
        ),
        Err(e) => log(
            Level::Error,
            Domain::Grade,
            "resolve_failed",
            obj(&[
                ("session_id", v_num(session.id as f64)),
                ("error", v_str(&e.to_string())),
            ]),
        ),
    }
}

/// Analytics sidecar: grades the non-traded snapshots against their
/// theoretical levels. Read failures are skipped outright; nothing here
/// can influence the real session outcome.
pub async fn grade_theoretical(
    session: Session,
    rows: Vec<SnapshotRow>,
    quotes: Arc<dyn QuoteSource>,
    store: SharedStore,
    shutdown: watch::Receiver<bool>,
    poll: Duration,
) {
    let mut pending: Vec<(String, f64, f64)> = rows
        .into_iter()
        .filter(|r| r.symbol != session.symbol && r.symbol != TOTAL_SYMBOL)
        .filter_map(|r| Some((r.symbol, r.theo_target?, r.theo_stop?)))
        .collect();
    if pending.is_empty() {
        return;
    }

    let deadline = session.deadline();
    let mut shutdown = shutdown;

    loop {
        if *shutdown.borrow() {
            return;
        }
        if now_ts() > deadline {
            for (symbol, _, _) in &pending {
                set_theo(&store, session.id, symbol, Outcome::Expired);
            }
            return;
        }

        let mut still_pending = Vec::with_capacity(pending.len());
        for (symbol, target, stop) in pending {
            match quotes.latest(&symbol).await {
                Ok(quote) => match first_touch(session.entry_side, quote.bid, target, stop) {
                    Some(outcome) => set_theo(&store, session.id, &symbol, outcome),
                    None => still_pending.push((symbol, target, stop)),
                },
                Err(_) => still_pending.push((symbol, target, stop)),
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            return;
        }

        tokio::select! {
            _ = sleep(poll) => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn set_theo(store: &SharedStore, session_id: i64, symbol: &str, outcome: Outcome) {
    match lock_store(store).set_theo_outcome(session_id, symbol, outcome) {
        Ok(_) => log(
            Level::Debug,
            Domain::Grade,
            "theo_resolved",
            obj(&[
                ("session_id", v_num(session_id as f64)),
                ("symbol", v_str(symbol)),
                ("outcome", v_str(outcome.as_str())),
            ]),
        ),
        Err(e) => log(
            Level::Warn,
            Domain::Grade,
            "theo_resolve_failed",
            obj(&[("session_id", v_num(session_id as f64)), ("error", v_str(&e.to_string()))]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::{Quote, ScriptedQuoteSource};
    use crate::session::EntrySide;
    use crate::signal::Signal;
    use crate::store::{into_shared, SessionStore};

    fn q(bid: f64) -> Quote {
        Quote { bid, ask: bid + 8.0, last: bid, prior_close: None, ts: now_ts() }
    }

    fn shared_store() -> SharedStore {
        let mut store = SessionStore::new(":memory:").unwrap();
        store.init().unwrap();
        into_shared(store)
    }

    fn pending_session(store: &SharedStore, side: EntrySide, opened_at: i64, window: u64) -> Session {
        pending_session_with_rows(store, side, opened_at, window, &[])
    }

    fn pending_session_with_rows(
        store: &SharedStore,
        side: EntrySide,
        opened_at: i64,
        window: u64,
        rows: &[SnapshotRow],
    ) -> Session {
        let (entry, target, stop) = match side {
            EntrySide::Buy => (47388.0, 47408.0, 47368.0),
            _ => (47380.0, 47360.0, 47400.0),
        };
        let mut session = Session {
            id: 0,
            region_id: "japan".to_string(),
            trade_day: "2026-01-05".to_string(),
            symbol: "YM".to_string(),
            opened_at,
            composite_signal: if side == EntrySide::Buy { Signal::Buy } else { Signal::Sell },
            composite_score: if side == EntrySide::Buy { 5.0 } else { -5.0 },
            entry_side: side,
            entry_price: Some(entry),
            target_price: Some(target),
            stop_price: Some(stop),
            evaluation_window_secs: window,
            outcome: crate::session::Outcome::Pending,
            resolution_price: None,
            resolved_at: None,
            resolution_reason: None,
        };
        let id = lock_store(store).insert_session(&session, rows).unwrap().unwrap();
        session.id = id;
        session
    }

    fn idle_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn theo_rows() -> Vec<SnapshotRow> {
        vec![SnapshotRow {
            symbol: "ES".to_string(),
            bid: Some(5000.0),
            ask: Some(5000.25),
            last: Some(5000.0),
            spread: Some(0.25),
            signal: Some(Signal::Buy),
            signal_weight: 1,
            stat_value: 10.0,
            theo_entry: Some(5000.25),
            theo_target: Some(5002.25),
            theo_stop: Some(4998.25),
            theo_outcome: None,
        }]
    }

    #[tokio::test]
    async fn test_target_touch_works() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("YM", q(47390.0));
        quotes.push("YM", q(47409.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Worked);
        assert_eq!(got.resolution_price, Some(47409.0));
        assert!(got.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_touch_first_didnt_work() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        // Stop is touched on the first observation; the later rally is
        // never seen.
        quotes.push("YM", q(47368.0));
        quotes.push("YM", q(47500.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::DidntWork);
        assert_eq!(got.resolution_price, Some(47368.0));
    }

    #[tokio::test]
    async fn test_sell_side_inverts() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Sell, now_ts(), 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("YM", q(47359.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Worked);
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let store = shared_store();
        // Window already elapsed when the grader starts.
        let session = pending_session(&store, EntrySide::Buy, now_ts() - 7200, 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("YM", q(47390.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Expired);
        assert_eq!(got.resolution_price, None);
    }

    #[tokio::test]
    async fn test_persistent_read_failure_errors() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        // No script at all: every read fails.
        let quotes = Arc::new(ScriptedQuoteSource::new());

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(1), 2).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Error);
        assert_eq!(got.resolution_price, None);
    }

    #[tokio::test]
    async fn test_transient_read_failure_tolerated() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        // Script appears only after the grader has already failed a few
        // reads; with a generous tolerance it recovers and resolves.
        let quotes_bg = quotes.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            quotes_bg.push("YM", q(47409.0));
        });

        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes.clone(), store.clone(), shutdown, Duration::from_millis(5), 50).await;
        handle.await.unwrap();

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Worked);
    }

    #[tokio::test]
    async fn test_terminal_rows_never_rewritten() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        lock_store(&store)
            .resolve_session(session.id, Outcome::Worked, Some(47409.0), now_ts(), "target touched")
            .unwrap();

        // A stale grader ticking against a resolved row changes nothing.
        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("YM", q(47368.0));
        let (_keep, shutdown) = idle_shutdown();
        grade_session(session.clone(), quotes, store.clone(), shutdown, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Worked);
        assert_eq!(got.resolution_price, Some(47409.0));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_pending() {
        let store = shared_store();
        let session = pending_session(&store, EntrySide::Buy, now_ts(), 3600);
        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("YM", q(47390.0));

        let (_tx, rx) = watch::channel(true);
        grade_session(session.clone(), quotes, store.clone(), rx, Duration::from_millis(5), 3).await;

        let got = lock_store(&store).session_by_id(session.id).unwrap().unwrap();
        assert_eq!(got.outcome, Outcome::Pending);
    }

    #[tokio::test]
    async fn test_theoretical_pass() {
        let store = shared_store();
        let rows = theo_rows();
        let session = pending_session_with_rows(&store, EntrySide::Buy, now_ts(), 3600, &rows);

        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("ES", q(5003.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_theoretical(session.clone(), rows, quotes, store.clone(), shutdown, Duration::from_millis(5)).await;

        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        let es = snaps.iter().find(|s| s.symbol == "ES").unwrap();
        assert_eq!(es.theo_outcome, Some(Outcome::Worked));
    }

    #[tokio::test]
    async fn test_theoretical_expiry() {
        let store = shared_store();
        let rows = theo_rows();
        let session = pending_session_with_rows(&store, EntrySide::Buy, now_ts() - 7200, 3600, &rows);

        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("ES", q(5001.0));

        let (_keep, shutdown) = idle_shutdown();
        grade_theoretical(session.clone(), rows, quotes, store.clone(), shutdown, Duration::from_millis(5)).await;

        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        let es = snaps.iter().find(|s| s.symbol == "ES").unwrap();
        assert_eq!(es.theo_outcome, Some(Outcome::Expired));
    }

    #[tokio::test]
    async fn test_theoretical_skips_traded_and_total() {
        let store = shared_store();
        let mut rows = theo_rows();
        rows.push(SnapshotRow {
            symbol: "YM".to_string(),
            bid: Some(47380.0),
            ask: Some(47388.0),
            last: Some(47385.0),
            spread: Some(8.0),
            signal: Some(Signal::Buy),
            signal_weight: 1,
            stat_value: 50.0,
            theo_entry: Some(47388.0),
            theo_target: Some(47408.0),
            theo_stop: Some(47368.0),
            theo_outcome: None,
        });
        let session = pending_session_with_rows(&store, EntrySide::Buy, now_ts(), 3600, &rows);

        let quotes = Arc::new(ScriptedQuoteSource::new());
        quotes.push("ES", q(5003.0));
        // Note: no YM script; if YM were polled, the pass would stall on
        // read failures instead of finishing.

        let (_keep, shutdown) = idle_shutdown();
        grade_theoretical(session.clone(), rows, quotes, store.clone(), shutdown, Duration::from_millis(5)).await;

        let snaps = lock_store(&store).snapshots_for(session.id).unwrap();
        let ym = snaps.iter().find(|s| s.symbol == "YM").unwrap();
        assert_eq!(ym.theo_outcome, None);
    }
}
