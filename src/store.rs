//! Session persistence on sqlite: atomic session+snapshot inserts with a
//! uniqueness guarantee per (region, trading day), conditional terminal
//! updates, and the audit/stats side tables.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::session::{EntrySide, Outcome, Session, SnapshotRow};
use crate::signal::Signal;

pub struct SessionStore {
    conn: Connection,
}

/// Store handle shared across capture, graders, and monitors. The lock is
/// held only for the duration of a single statement or short transaction.
pub type SharedStore = Arc<Mutex<SessionStore>>;

pub fn into_shared(store: SessionStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, SessionStore> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

const SESSION_COLS: &str = "id, region_id, trade_day, symbol, opened_at, composite_signal, composite_score, \
     entry_side, entry_price, target_price, stop_price, evaluation_window_secs, \
     outcome, resolution_price, resolved_at, resolution_reason";

impl SessionStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region_id TEXT NOT NULL,
                trade_day TEXT NOT NULL,
                symbol TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                composite_signal TEXT NOT NULL,
                composite_score REAL NOT NULL,
                entry_side TEXT NOT NULL,
                entry_price REAL,
                target_price REAL,
                stop_price REAL,
                evaluation_window_secs INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                resolution_price REAL,
                resolved_at INTEGER,
                resolution_reason TEXT,
                UNIQUE(region_id, trade_day)
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                symbol TEXT NOT NULL,
                bid REAL,
                ask REAL,
                last REAL,
                spread REAL,
                signal TEXT,
                signal_weight INTEGER NOT NULL,
                stat_value REAL NOT NULL,
                theo_entry REAL,
                theo_target REAL,
                theo_stop REAL,
                theo_outcome TEXT,
                UNIQUE(session_id, symbol)
            );
            CREATE TABLE IF NOT EXISTS capture_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS intraday_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region_id TEXT NOT NULL,
                trade_day TEXT NOT NULL,
                symbol TEXT NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                range REAL NOT NULL,
                UNIQUE(region_id, trade_day, symbol)
            );
            CREATE TABLE IF NOT EXISTS rolling_extremes (
                symbol TEXT PRIMARY KEY,
                high_52w REAL NOT NULL,
                low_52w REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn session_exists(&self, region_id: &str, trade_day: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE region_id = ?1 AND trade_day = ?2",
            params![region_id, trade_day],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert a session and all its snapshots in one transaction. Returns
    /// None when the (region, trade_day) row already exists; nothing is
    /// written in that case.
    pub fn insert_session(&mut self, session: &Session, rows: &[SnapshotRow]) -> Result<Option<i64>> {
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO sessions (region_id, trade_day, symbol, opened_at, composite_signal, composite_score, \
             entry_side, entry_price, target_price, stop_price, evaluation_window_secs, \
             outcome, resolution_price, resolved_at, resolution_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                session.region_id,
                session.trade_day,
                session.symbol,
                session.opened_at,
                session.composite_signal.as_str(),
                session.composite_score,
                session.entry_side.as_str(),
                session.entry_price,
                session.target_price,
                session.stop_price,
                session.evaluation_window_secs as i64,
                session.outcome.as_str(),
                session.resolution_price,
                session.resolved_at,
                session.resolution_reason,
            ],
        );
        let session_id = match inserted {
            Ok(_) => tx.last_insert_rowid(),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        for row in rows {
            tx.execute(
                "INSERT INTO snapshots (session_id, symbol, bid, ask, last, spread, signal, signal_weight, \
                 stat_value, theo_entry, theo_target, theo_stop, theo_outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    session_id,
                    row.symbol,
                    row.bid,
                    row.ask,
                    row.last,
                    row.spread,
                    row.signal.map(|s| s.as_str()),
                    row.signal_weight,
                    row.stat_value,
                    row.theo_entry,
                    row.theo_target,
                    row.theo_stop,
                    row.theo_outcome.map(|o| o.as_str()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(Some(session_id))
    }

    /// Terminal write, guarded on the row still being PENDING. Returns
    /// false when the session was already resolved (the update is a no-op).
    pub fn resolve_session(
        &mut self,
        session_id: i64,
        outcome: Outcome,
        resolution_price: Option<f64>,
        resolved_at: i64,
        reason: &str,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET outcome = ?1, resolution_price = ?2, resolved_at = ?3, resolution_reason = ?4
             WHERE id = ?5 AND outcome = 'PENDING'",
            params![outcome.as_str(), resolution_price, resolved_at, reason, session_id],
        )?;
        Ok(changed > 0)
    }

    pub fn session_for(&self, region_id: &str, trade_day: &str) -> Result<Option<Session>> {
        let session = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE region_id = ?1 AND trade_day = ?2", SESSION_COLS),
                params![region_id, trade_day],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn session_by_id(&self, session_id: i64) -> Result<Option<Session>> {
        let session = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLS),
                params![session_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions left mid-grade by a previous process, in need of a fresh
    /// grader.
    pub fn pending_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM sessions WHERE outcome = 'PENDING' ORDER BY id", SESSION_COLS))?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn sessions_filtered(
        &self,
        region_id: Option<&str>,
        outcome: Option<Outcome>,
        from_day: Option<&str>,
        to_day: Option<&str>,
    ) -> Result<Vec<Session>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(r) = region_id {
            args.push(r.to_string());
            clauses.push(format!("region_id = ?{}", args.len()));
        }
        if let Some(o) = outcome {
            args.push(o.as_str().to_string());
            clauses.push(format!("outcome = ?{}", args.len()));
        }
        if let Some(d) = from_day {
            args.push(d.to_string());
            clauses.push(format!("trade_day >= ?{}", args.len()));
        }
        if let Some(d) = to_day {
            args.push(d.to_string());
            clauses.push(format!("trade_day <= ?{}", args.len()));
        }
        let mut sql = format!("SELECT {} FROM sessions", SESSION_COLS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY trade_day, region_id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Outcome distribution, optionally per region.
    pub fn hit_rate(&self, region_id: Option<&str>) -> Result<HitRate> {
        let mut sql = "SELECT outcome, COUNT(*) FROM sessions".to_string();
        if region_id.is_some() {
            sql.push_str(" WHERE region_id = ?1");
        }
        sql.push_str(" GROUP BY outcome");
        let mut stmt = self.conn.prepare(&sql)?;

        let mut tally = HitRate::default();
        let mut fold = |outcome: String, count: i64| {
            match Outcome::parse(&outcome) {
                Some(Outcome::Worked) => tally.worked = count as u32,
                Some(Outcome::DidntWork) => tally.didnt_work = count as u32,
                Some(Outcome::Expired) => tally.expired = count as u32,
                Some(Outcome::NoEntry) => tally.no_entry = count as u32,
                Some(Outcome::Error) => tally.error = count as u32,
                Some(Outcome::Pending) => tally.pending = count as u32,
                None => {}
            }
        };
        if let Some(region) = region_id {
            let rows = stmt.query_map(params![region], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (outcome, count) = row?;
                fold(outcome, count);
            }
        } else {
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (outcome, count) = row?;
                fold(outcome, count);
            }
        }
        Ok(tally)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshots_for(&self, session_id: i64) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, bid, ask, last, spread, signal, signal_weight, stat_value, \
             theo_entry, theo_target, theo_stop, theo_outcome
             FROM snapshots WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// One-shot theoretical outcome per snapshot; later writes lose.
    pub fn set_theo_outcome(&mut self, session_id: i64, symbol: &str, outcome: Outcome) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE snapshots SET theo_outcome = ?1
             WHERE session_id = ?2 AND symbol = ?3 AND theo_outcome IS NULL",
            params![outcome.as_str(), session_id, symbol],
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Audit and stats tables
    // =========================================================================

    pub fn record_capture_failure(&mut self, region_id: &str, ts: i64, reason: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO capture_failures (region_id, ts, reason) VALUES (?1, ?2, ?3)",
            params![region_id, ts, reason],
        )?;
        Ok(())
    }

    pub fn capture_failure_count(&self, region_id: &str) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM capture_failures WHERE region_id = ?1",
            params![region_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn write_intraday_stat(
        &mut self,
        region_id: &str,
        trade_day: &str,
        symbol: &str,
        high: f64,
        low: f64,
        close: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO intraday_stats (region_id, trade_day, symbol, high, low, close, range)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(region_id, trade_day, symbol) DO UPDATE SET
                 high = excluded.high, low = excluded.low, close = excluded.close, range = excluded.range",
            params![region_id, trade_day, symbol, high, low, close, high - low],
        )?;
        Ok(())
    }

    pub fn intraday_stat(&self, region_id: &str, trade_day: &str, symbol: &str) -> Result<Option<(f64, f64, f64, f64)>> {
        let row = self
            .conn
            .query_row(
                "SELECT high, low, close, range FROM intraday_stats
                 WHERE region_id = ?1 AND trade_day = ?2 AND symbol = ?3",
                params![region_id, trade_day, symbol],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn rolling_extreme(&self, symbol: &str) -> Result<Option<(f64, f64)>> {
        let row = self
            .conn
            .query_row(
                "SELECT high_52w, low_52w FROM rolling_extremes WHERE symbol = ?1",
                params![symbol],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Widen the stored 52-week band; never narrows it.
    pub fn update_rolling_extreme(&mut self, symbol: &str, high: f64, low: f64, ts: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rolling_extremes (symbol, high_52w, low_52w, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET
                 high_52w = MAX(high_52w, excluded.high_52w),
                 low_52w = MIN(low_52w, excluded.low_52w),
                 updated_at = excluded.updated_at",
            params![symbol, high, low, ts],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HitRate {
    pub worked: u32,
    pub didnt_work: u32,
    pub expired: u32,
    pub no_entry: u32,
    pub error: u32,
    pub pending: u32,
}

impl HitRate {
    /// Share of resolved directional trades that hit the target.
    pub fn win_rate(&self) -> Option<f64> {
        let decided = self.worked + self.didnt_work;
        if decided == 0 {
            return None;
        }
        Some(self.worked as f64 / decided as f64)
    }
}

fn bad_text(value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, value.into())
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let signal_str: String = row.get(5)?;
    let side_str: String = row.get(7)?;
    let outcome_str: String = row.get(12)?;
    Ok(Session {
        id: row.get(0)?,
        region_id: row.get(1)?,
        trade_day: row.get(2)?,
        symbol: row.get(3)?,
        opened_at: row.get(4)?,
        composite_signal: Signal::parse(&signal_str).ok_or_else(|| bad_text(signal_str))?,
        composite_score: row.get(6)?,
        entry_side: EntrySide::parse(&side_str).ok_or_else(|| bad_text(side_str))?,
        entry_price: row.get(8)?,
        target_price: row.get(9)?,
        stop_price: row.get(10)?,
        evaluation_window_secs: row.get::<_, i64>(11)? as u64,
        outcome: Outcome::parse(&outcome_str).ok_or_else(|| bad_text(outcome_str))?,
        resolution_price: row.get(13)?,
        resolved_at: row.get(14)?,
        resolution_reason: row.get(15)?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    let signal_str: Option<String> = row.get(5)?;
    let theo_str: Option<String> = row.get(11)?;
    let signal = match signal_str {
        Some(s) => Some(Signal::parse(&s).ok_or_else(|| bad_text(s))?),
        None => None,
    };
    let theo_outcome = match theo_str {
        Some(s) => Some(Outcome::parse(&s).ok_or_else(|| bad_text(s))?),
        None => None,
    };
    Ok(SnapshotRow {
        symbol: row.get(0)?,
        bid: row.get(1)?,
        ask: row.get(2)?,
        last: row.get(3)?,
        spread: row.get(4)?,
        signal,
        signal_weight: row.get(6)?,
        stat_value: row.get(7)?,
        theo_entry: row.get(8)?,
        theo_target: row.get(9)?,
        theo_stop: row.get(10)?,
        theo_outcome,
    })
}
