#[derive(Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub quote_base: String,
    pub calendar_base: String,
    /// Symbol of the one instrument the simulated trade is placed on.
    pub traded_symbol: String,
    pub fixed_dollar_risk: f64,
    pub evaluation_window_secs: u64,
    pub region_poll_secs: u64,
    pub grader_poll_secs: u64,
    pub grader_max_read_failures: u32,
    pub monitor_poll_secs: u64,
    /// Composite score band edges: |sum| <= weak is HOLD, |sum| > strong is STRONG_*.
    pub composite_weak: f64,
    pub composite_strong: f64,
    pub capture_max_retries: u32,
    pub capture_backoff_ms: u64,
    pub theoretical_grading: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./openbell.sqlite".to_string()),
            quote_base: std::env::var("QUOTE_BASE").unwrap_or_else(|_| "http://localhost:8090".to_string()),
            calendar_base: std::env::var("CALENDAR_BASE").unwrap_or_else(|_| "http://localhost:8091".to_string()),
            traded_symbol: std::env::var("TRADED_SYMBOL").unwrap_or_else(|_| "YM".to_string()),
            fixed_dollar_risk: std::env::var("FIXED_RISK").ok().and_then(|v| v.parse().ok()).unwrap_or(100.0),
            evaluation_window_secs: std::env::var("EVAL_WINDOW_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
            region_poll_secs: std::env::var("REGION_POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            grader_poll_secs: std::env::var("GRADER_POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            grader_max_read_failures: std::env::var("GRADER_MAX_READ_FAILURES").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            monitor_poll_secs: std::env::var("MONITOR_POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            composite_weak: std::env::var("COMPOSITE_WEAK").ok().and_then(|v| v.parse().ok()).unwrap_or(3.0),
            composite_strong: std::env::var("COMPOSITE_STRONG").ok().and_then(|v| v.parse().ok()).unwrap_or(9.0),
            capture_max_retries: std::env::var("CAPTURE_MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            capture_backoff_ms: std::env::var("CAPTURE_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(500),
            theoretical_grading: std::env::var("THEORETICAL_GRADING")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
        }
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = Config::from_env();
        assert!(cfg.fixed_dollar_risk > 0.0);
        assert!(cfg.grader_poll_secs < 5, "grader must poll sub-5s");
        assert!(cfg.composite_weak < cfg.composite_strong);
    }
}
