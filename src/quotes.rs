//! Live quote access. One trait seam, an HTTP implementation against the
//! external quote store, and a scripted stub to make integration explicit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// Reference baseline for the net-change classification; absent when
    /// the upstream store has no prior print.
    pub prior_close: Option<f64>,
    pub ts: i64,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn net_change(&self) -> Option<f64> {
        let base = self.prior_close.filter(|p| p.is_finite())?;
        let last = Some(self.last).filter(|l| l.is_finite())?;
        Some(last - base)
    }
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn latest(&self, symbol: &str) -> Result<Quote>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Deserialize)]
struct QuoteDto {
    bid: f64,
    ask: f64,
    last: f64,
    prior_close: Option<f64>,
    ts: i64,
}

pub struct HttpQuoteSource {
    client: reqwest::Client,
    base: String,
}

impl HttpQuoteSource {
    pub fn new(base: String) -> Self {
        Self { client: reqwest::Client::new(), base }
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn latest(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/quotes/{}", self.base, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("quote fetch {}", symbol))?;
        if !resp.status().is_success() {
            return Err(anyhow!("quote fetch {}: http {}", symbol, resp.status()));
        }
        let dto: QuoteDto = resp.json().await.with_context(|| format!("quote decode {}", symbol))?;
        Ok(Quote {
            bid: dto.bid,
            ask: dto.ask,
            last: dto.last,
            prior_close: dto.prior_close,
            ts: dto.ts,
        })
    }
}

// =============================================================================
// Scripted stub
// =============================================================================

/// Replays a fixed per-symbol sequence of quotes; the final quote repeats
/// once the script runs dry. Symbols without a script error like a dead
/// upstream would.
pub struct ScriptedQuoteSource {
    scripts: Mutex<HashMap<String, VecDeque<Quote>>>,
}

impl ScriptedQuoteSource {
    pub fn new() -> Self {
        Self { scripts: Mutex::new(HashMap::new()) }
    }

    pub fn push(&self, symbol: &str, quote: Quote) {
        let mut scripts = self.lock();
        scripts.entry(symbol.to_string()).or_default().push_back(quote);
    }

    pub fn set_constant(&self, symbol: &str, quote: Quote) {
        let mut scripts = self.lock();
        let q = scripts.entry(symbol.to_string()).or_default();
        q.clear();
        q.push_back(quote);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Quote>>> {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedQuoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteSource for ScriptedQuoteSource {
    async fn latest(&self, symbol: &str) -> Result<Quote> {
        let mut scripts = self.lock();
        let script = scripts
            .get_mut(symbol)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("no quote for {}", symbol))?;
        if script.len() == 1 {
            Ok(script[0])
        } else {
            script.pop_front().ok_or_else(|| anyhow!("no quote for {}", symbol))
        }
    }
}
