//! Environment-based configuration.

use std::time::Duration;

use crate::run_state::{CatchupPolicy, OverlapPolicy};

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL (unset means in-memory stores only)
    pub database_url: Option<String>,

    /// Milliseconds between scheduler ticks
    pub tick_ms: u64,

    /// Scheduler lookahead window in milliseconds
    pub lookahead_ms: u64,

    /// Maximum fire times emitted per schedule per tick
    pub max_catchup_per_tick: usize,

    /// Overlap policy applied when a schedule does not set one
    pub default_overlap_policy: OverlapPolicy,

    /// Catchup policy applied when a schedule does not set one
    pub default_catchup_policy: CatchupPolicy,

    /// Jitter applied when a schedule does not set one
    pub default_jitter_ms: u64,

    /// Upper bound on a single retry backoff delay
    pub max_retry_delay_ms: u64,

    /// TTL for cached action results, in seconds
    pub idempotency_cache_ttl_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_ms: 1_000,
            lookahead_ms: 60_000,
            max_catchup_per_tick: 100,
            default_overlap_policy: OverlapPolicy::Allow,
            default_catchup_policy: CatchupPolicy::None,
            default_jitter_ms: 0,
            max_retry_delay_ms: 30_000,
            idempotency_cache_ttl_s: 86_400,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let database_url = std::env::var("WEAVE_DATABASE_URL").ok();

        let tick_ms = parse_var("TICK_MS", defaults.tick_ms)?;
        let lookahead_ms = parse_var("LOOKAHEAD_MS", defaults.lookahead_ms)?;
        let max_catchup_per_tick =
            parse_var("MAX_CATCHUP_PER_TICK", defaults.max_catchup_per_tick)?;
        let default_jitter_ms = parse_var("DEFAULT_JITTER_MS", defaults.default_jitter_ms)?;
        let max_retry_delay_ms = parse_var("MAX_RETRY_DELAY_MS", defaults.max_retry_delay_ms)?;
        let idempotency_cache_ttl_s =
            parse_var("IDEMPOTENCY_CACHE_TTL_S", defaults.idempotency_cache_ttl_s)?;

        let default_overlap_policy = match std::env::var("DEFAULT_OVERLAP_POLICY") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid DEFAULT_OVERLAP_POLICY '{raw}'"))?,
            Err(_) => defaults.default_overlap_policy,
        };
        let default_catchup_policy = match std::env::var("DEFAULT_CATCHUP_POLICY") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid DEFAULT_CATCHUP_POLICY '{raw}'"))?,
            Err(_) => defaults.default_catchup_policy,
        };

        Ok(Config {
            database_url,
            tick_ms,
            lookahead_ms,
            max_catchup_per_tick,
            default_overlap_policy,
            default_catchup_policy,
            default_jitter_ms,
            max_retry_delay_ms,
            idempotency_cache_ttl_s,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_cache_ttl_s)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {name} '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.tick_ms, 1_000);
        assert_eq!(config.lookahead_ms, 60_000);
        assert_eq!(config.max_catchup_per_tick, 100);
        assert_eq!(config.max_retry_delay_ms, 30_000);
        assert_eq!(config.idempotency_cache_ttl_s, 86_400);
        assert_eq!(config.default_overlap_policy, OverlapPolicy::Allow);
        assert_eq!(config.default_catchup_policy, CatchupPolicy::None);
    }
}
