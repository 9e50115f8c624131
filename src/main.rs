use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use openbell::calendar::{HttpCalendar, Region};
use openbell::config::Config;
use openbell::coordinator::Coordinator;
use openbell::logging::{log, obj, v_num, v_str, Domain, Level};
use openbell::quotes::HttpQuoteSource;
use openbell::registry::Registry;
use openbell::store::{into_shared, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let registry = Registry::default_set();
    let regions = Region::default_set();

    let mut store = SessionStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let store = into_shared(store);

    let quotes = Arc::new(HttpQuoteSource::new(cfg.quote_base.clone()));
    let calendar = Arc::new(HttpCalendar::new(cfg.calendar_base.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    log(
        Level::Info,
        Domain::System,
        "starting",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("traded_symbol", v_str(&cfg.traded_symbol)),
            ("instruments", v_num(registry.tracked().len() as f64)),
            ("regions", v_num(regions.len() as f64)),
        ]),
    );

    let mut coordinator = Coordinator::new(cfg, registry, regions, quotes, calendar, store, shutdown_rx);
    // Sessions left mid-grade by a previous run resume before the first sweep.
    coordinator.reattach_pending()?;
    coordinator.run().await;
    Ok(())
}
