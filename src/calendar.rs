//! Region reference data and market open/closed status access.
//!
//! The external calendar service is the only authority on when a market
//! is open; this module never computes trading calendars itself.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
}

impl MarketStatus {
    pub fn parse(s: &str) -> Option<MarketStatus> {
        match s {
            "OPEN" => Some(MarketStatus::Open),
            "CLOSED" => Some(MarketStatus::Closed),
            _ => None,
        }
    }
}

/// One monitored market region. Flags are operator controls resolved once
/// at load; the engine only reads them.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: String,
    pub display_name: String,
    /// Names the region-local calendar date for session keying.
    pub utc_offset_minutes: i32,
    pub is_active: bool,
    pub capture_enabled: bool,
    pub open_capture_enabled: bool,
    pub evaluation_window_secs: Option<u64>,
}

impl Region {
    /// Region-local calendar date for a UTC timestamp.
    pub fn trade_day(&self, ts_secs: i64) -> String {
        let utc = DateTime::<Utc>::from_timestamp(ts_secs, 0).unwrap_or_default();
        let local = utc + Duration::minutes(self.utc_offset_minutes as i64);
        local.format("%Y-%m-%d").to_string()
    }

    pub fn default_set() -> Vec<Region> {
        let mk = |id: &str, name: &str, offset: i32| Region {
            id: id.to_string(),
            display_name: name.to_string(),
            utc_offset_minutes: offset,
            is_active: true,
            capture_enabled: true,
            open_capture_enabled: true,
            evaluation_window_secs: None,
        };
        vec![
            mk("japan", "Japan", 9 * 60),
            mk("australia", "Australia", 10 * 60),
            mk("london", "London", 0),
            mk("usa", "USA", -5 * 60),
        ]
    }
}

#[async_trait]
pub trait MarketCalendar: Send + Sync {
    async fn status(&self, region_id: &str) -> Result<MarketStatus>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Deserialize)]
struct StatusDto {
    status: String,
}

pub struct HttpCalendar {
    client: reqwest::Client,
    base: String,
}

impl HttpCalendar {
    pub fn new(base: String) -> Self {
        Self { client: reqwest::Client::new(), base }
    }
}

#[async_trait]
impl MarketCalendar for HttpCalendar {
    async fn status(&self, region_id: &str) -> Result<MarketStatus> {
        let url = format!("{}/regions/{}/status", self.base, region_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("calendar status {}", region_id))?;
        if !resp.status().is_success() {
            return Err(anyhow!("calendar status {}: http {}", region_id, resp.status()));
        }
        let dto: StatusDto = resp.json().await.with_context(|| format!("calendar decode {}", region_id))?;
        MarketStatus::parse(&dto.status).ok_or_else(|| anyhow!("calendar status {}: bad value {}", region_id, dto.status))
    }
}

// =============================================================================
// Static stub
// =============================================================================

/// Settable in-memory calendar; unknown regions read CLOSED.
pub struct StaticCalendar {
    statuses: Mutex<HashMap<String, MarketStatus>>,
}

impl StaticCalendar {
    pub fn new() -> Self {
        Self { statuses: Mutex::new(HashMap::new()) }
    }

    pub fn set(&self, region_id: &str, status: MarketStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(region_id.to_string(), status);
    }
}

impl Default for StaticCalendar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketCalendar for StaticCalendar {
    async fn status(&self, region_id: &str) -> Result<MarketStatus> {
        Ok(*self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(region_id)
            .unwrap_or(&MarketStatus::Closed))
    }
}
