//! [`AnalysisConfig`]: concurrency budgets, per-card timeouts, and cache
//! TTLs, loaded via `from_env()` following the teacher's
//! `Config::from_env()` convention in `server/src/server/main.rs`.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::source::Source;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Default per-source cache TTLs (§4.3: "scholar long, linkedin longer,
/// github shorter"), overridable by configuration.
fn default_ttls() -> HashMap<String, Duration> {
    let mut ttls = HashMap::new();
    ttls.insert("scholar".to_string(), Duration::from_secs(7 * 24 * 3600));
    ttls.insert("linkedin".to_string(), Duration::from_secs(14 * 24 * 3600));
    ttls.insert("github".to_string(), Duration::from_secs(24 * 3600));
    ttls.insert("twitter".to_string(), Duration::from_secs(6 * 3600));
    ttls.insert("openreview".to_string(), Duration::from_secs(7 * 24 * 3600));
    ttls.insert("huggingface".to_string(), Duration::from_secs(24 * 3600));
    ttls.insert("youtube".to_string(), Duration::from_secs(12 * 3600));
    ttls
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Worker pool size for the scheduler (§4.7: "default small, e.g. 4").
    pub worker_pool_size: usize,
    /// Per-concurrency-group budgets, e.g. `llm=4`. A group absent from
    /// this map is treated as unlimited.
    pub concurrency_budgets: HashMap<String, usize>,
    /// Default per-card soft deadline, overridable per card type.
    pub default_card_deadline: Duration,
    pub card_deadlines: HashMap<String, Duration>,
    /// Bounded retry budget before a card is handed to `fallback` (§4.7
    /// quality gate).
    pub max_card_retries: u32,
    pub cache_ttls: HashMap<String, Duration>,
    /// Bound on how long past `freshness_until` a stale entry is still
    /// servicable for prefill (§4.8 "hit, stale but within max-stale").
    pub max_stale: Duration,
    /// SSE heartbeat interval for idle connections (§4.4, default 15s).
    pub sse_heartbeat_interval: Duration,
    /// SSE tail-poll interval when no wake-up bus ping has arrived.
    pub sse_poll_interval: Duration,
    /// Refresh lock safety TTL (§4.8).
    pub refresh_lock_ttl: Duration,
    /// Background refresh pool worker count (§4.9, default 2).
    pub background_refresh_workers: usize,
    pub background_refresh_queue_capacity: usize,
    /// Bounded grace window for cooperative cancellation (§5).
    pub cancellation_grace_window: Duration,
}

impl AnalysisConfig {
    fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
        match env::var(key) {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: v }),
            Err(_) => Ok(default),
        }
    }

    fn env_secs(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(Self::env_usize(key, default_secs as usize)? as u64))
    }

    /// Loads overrides from the process environment (via `dotenvy` in the
    /// binary crate), falling back to spec-documented defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut concurrency_budgets = HashMap::new();
        concurrency_budgets.insert("llm".to_string(), Self::env_usize("ANALYSIS_LLM_BUDGET", 4)?);

        Ok(AnalysisConfig {
            worker_pool_size: Self::env_usize("ANALYSIS_WORKER_POOL_SIZE", 4)?,
            concurrency_budgets,
            default_card_deadline: Self::env_secs("ANALYSIS_DEFAULT_CARD_DEADLINE_SECS", 30)?,
            card_deadlines: HashMap::new(),
            max_card_retries: Self::env_usize("ANALYSIS_MAX_CARD_RETRIES", 2)? as u32,
            cache_ttls: default_ttls(),
            max_stale: Self::env_secs("ANALYSIS_MAX_STALE_SECS", 3 * 24 * 3600)?,
            sse_heartbeat_interval: Self::env_secs("ANALYSIS_SSE_HEARTBEAT_SECS", 15)?,
            sse_poll_interval: Duration::from_millis(
                Self::env_usize("ANALYSIS_SSE_POLL_MS", 250)? as u64,
            ),
            refresh_lock_ttl: Self::env_secs("ANALYSIS_REFRESH_LOCK_TTL_SECS", 600)?,
            background_refresh_workers: Self::env_usize("ANALYSIS_BG_REFRESH_WORKERS", 2)?,
            background_refresh_queue_capacity: Self::env_usize(
                "ANALYSIS_BG_REFRESH_QUEUE_CAPACITY",
                256,
            )?,
            cancellation_grace_window: Self::env_secs("ANALYSIS_CANCEL_GRACE_SECS", 5)?,
        })
    }

    pub fn ttl_for(&self, source: &Source) -> Duration {
        self.cache_ttls
            .get(source.tag())
            .copied()
            .unwrap_or(Duration::from_secs(24 * 3600))
    }

    pub fn deadline_for(&self, card_type: &str) -> Duration {
        self.card_deadlines
            .get(card_type)
            .copied()
            .unwrap_or(self.default_card_deadline)
    }

    pub fn budget_for(&self, concurrency_group: &str) -> Option<usize> {
        self.concurrency_budgets.get(concurrency_group).copied()
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            worker_pool_size: 4,
            concurrency_budgets: {
                let mut m = HashMap::new();
                m.insert("llm".to_string(), 4);
                m
            },
            default_card_deadline: Duration::from_secs(30),
            card_deadlines: HashMap::new(),
            max_card_retries: 2,
            cache_ttls: default_ttls(),
            max_stale: Duration::from_secs(3 * 24 * 3600),
            sse_heartbeat_interval: Duration::from_secs(15),
            sse_poll_interval: Duration::from_millis(250),
            refresh_lock_ttl: Duration::from_secs(600),
            background_refresh_workers: 2,
            background_refresh_queue_capacity: 256,
            cancellation_grace_window: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_examples() {
        let config = AnalysisConfig::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.budget_for("llm"), Some(4));
        assert_eq!(config.budget_for("resource"), None);
        assert!(config.ttl_for(&Source::Scholar) > config.ttl_for(&Source::Twitter));
        assert!(config.ttl_for(&Source::Linkedin) > config.ttl_for(&Source::Scholar));
    }

    #[test]
    fn unknown_card_type_falls_back_to_default_deadline() {
        let config = AnalysisConfig::default();
        assert_eq!(config.deadline_for("made_up_card"), config.default_card_deadline);
    }
}
