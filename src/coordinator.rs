//! Region lifecycle coordination: a single coarse polling loop that turns
//! calendar status edges into capture calls and task spawns. The
//! coordinator owns the task registry; it never does long blocking work
//! itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::calendar::{MarketCalendar, MarketStatus, Region};
use crate::capture::capture_open;
use crate::config::{now_ts, Config};
use crate::grader::{grade_session, grade_theoretical};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::monitor::run_region_monitor;
use crate::quotes::QuoteSource;
use crate::registry::Registry;
use crate::session::{Outcome, Session};
use crate::signal::Classifier;
use crate::store::{lock_store, SharedStore};

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Coordinator {
    cfg: Config,
    registry: Registry,
    regions: Vec<Region>,
    quotes: Arc<dyn QuoteSource>,
    calendar: Arc<dyn MarketCalendar>,
    store: SharedStore,
    shutdown: watch::Receiver<bool>,
    classifier: Classifier,
    last_status: HashMap<String, MarketStatus>,
    monitors: HashMap<String, MonitorHandle>,
    graders: Vec<JoinHandle<()>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        registry: Registry,
        regions: Vec<Region>,
        quotes: Arc<dyn QuoteSource>,
        calendar: Arc<dyn MarketCalendar>,
        store: SharedStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            registry,
            regions,
            quotes,
            calendar,
            store,
            shutdown,
            classifier: Classifier::new(),
            last_status: HashMap::new(),
            monitors: HashMap::new(),
            graders: Vec::new(),
        }
    }

    /// Re-arm graders for sessions a previous process left mid-grade. The
    /// grader needs nothing beyond the stored row.
    pub fn reattach_pending(&mut self) -> anyhow::Result<()> {
        let pending = lock_store(&self.store).pending_sessions()?;
        let count = pending.len();
        for session in pending {
            log(
                Level::Info,
                Domain::System,
                "grader_reattached",
                obj(&[
                    ("session_id", v_num(session.id as f64)),
                    ("region", v_str(&session.region_id)),
                    ("trade_day", v_str(&session.trade_day)),
                ]),
            );
            self.spawn_grader(session);
        }
        if count > 0 {
            log(
                Level::Info,
                Domain::System,
                "recovery_complete",
                obj(&[("reattached", v_num(count as f64))]),
            );
        }
        Ok(())
    }

    /// One status sweep over all active regions, firing edge handlers.
    pub async fn poll_once(&mut self) {
        self.graders.retain(|h| !h.is_finished());

        let regions: Vec<Region> = self.regions.iter().filter(|r| r.is_active).cloned().collect();
        for region in regions {
            let status = match self.calendar.status(&region.id).await {
                Ok(s) => s,
                Err(e) => {
                    // A dark calendar read changes nothing; the edge fires
                    // on the next successful sweep.
                    log(
                        Level::Warn,
                        Domain::Region,
                        "status_read_failed",
                        obj(&[("region", v_str(&region.id)), ("error", v_str(&e.to_string()))]),
                    );
                    continue;
                }
            };

            let prev = self.last_status.get(&region.id).copied();
            match (prev, status) {
                // First observation of an open market counts as an open
                // edge; the idempotency gate absorbs replays.
                (None, MarketStatus::Open) | (Some(MarketStatus::Closed), MarketStatus::Open) => {
                    self.on_open(&region).await;
                }
                (Some(MarketStatus::Open), MarketStatus::Closed) => {
                    self.on_close(&region).await;
                }
                _ => {}
            }
            self.last_status.insert(region.id.clone(), status);
        }
    }

    async fn on_open(&mut self, region: &Region) {
        log(
            Level::Info,
            Domain::Region,
            "market_open",
            obj(&[("region", v_str(&region.id))]),
        );

        let opened_at = now_ts();
        match capture_open(
            &self.cfg,
            &self.registry,
            &mut self.classifier,
            region,
            self.quotes.as_ref(),
            &self.store,
            opened_at,
        )
        .await
        {
            Ok(Some(session)) if session.outcome == Outcome::Pending => {
                if self.cfg.theoretical_grading {
                    self.spawn_theoretical(&session);
                }
                self.spawn_grader(session);
            }
            Ok(_) => {}
            Err(e) => {
                // Audit row already written by the capture path.
                log(
                    Level::Error,
                    Domain::Region,
                    "capture_failed",
                    obj(&[("region", v_str(&region.id)), ("error", v_str(&e.to_string()))]),
                );
            }
        }

        // Exactly one monitor per open region, re-entrant opens are no-ops.
        if !self.monitors.contains_key(&region.id) {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let handle = tokio::spawn(run_region_monitor(
                region.clone(),
                self.registry.symbols(),
                self.quotes.clone(),
                self.store.clone(),
                cancel_rx,
                Duration::from_secs(self.cfg.monitor_poll_secs.max(1)),
            ));
            self.monitors.insert(region.id.clone(), MonitorHandle { cancel: cancel_tx, handle });
        }
    }

    async fn on_close(&mut self, region: &Region) {
        log(
            Level::Info,
            Domain::Region,
            "market_close",
            obj(&[("region", v_str(&region.id))]),
        );
        // Graders are untouched: they run to their own terminal state.
        if let Some(monitor) = self.monitors.remove(&region.id) {
            let _ = monitor.cancel.send(true);
            let _ = monitor.handle.await;
        }
    }

    fn spawn_grader(&mut self, session: Session) {
        let handle = tokio::spawn(grade_session(
            session,
            self.quotes.clone(),
            self.store.clone(),
            self.shutdown.clone(),
            Duration::from_secs(self.cfg.grader_poll_secs.max(1)),
            self.cfg.grader_max_read_failures,
        ));
        self.graders.push(handle);
    }

    fn spawn_theoretical(&mut self, session: &Session) {
        let rows = match lock_store(&self.store).snapshots_for(session.id) {
            Ok(rows) => rows,
            Err(e) => {
                log(
                    Level::Warn,
                    Domain::Grade,
                    "theo_rows_unavailable",
                    obj(&[("session_id", v_num(session.id as f64)), ("error", v_str(&e.to_string()))]),
                );
                return;
            }
        };
        let handle = tokio::spawn(grade_theoretical(
            session.clone(),
            rows,
            self.quotes.clone(),
            self.store.clone(),
            self.shutdown.clone(),
            Duration::from_secs(self.cfg.grader_poll_secs.max(1)),
        ));
        self.graders.push(handle);
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn grader_count(&self) -> usize {
        self.graders.iter().filter(|h| !h.is_finished()).count()
    }

    /// Main loop: status sweeps at a coarse interval until shutdown, then
    /// an orderly drain.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(Duration::from_secs(self.cfg.region_poll_secs.max(1)));
        log(
            Level::Info,
            Domain::System,
            "coordinator_started",
            obj(&[("regions", v_num(self.regions.len() as f64))]),
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        self.drain().await;
    }

    async fn drain(&mut self) {
        for (_, monitor) in self.monitors.drain() {
            let _ = monitor.cancel.send(true);
            let _ = monitor.handle.await;
        }
        // Graders observe the same shutdown signal and detach, leaving
        // PENDING rows for the next start.
        for handle in self.graders.drain(..) {
            let _ = handle.await;
        }
        log(Level::Info, Domain::System, "coordinator_stopped", obj(&[]));
    }
}
