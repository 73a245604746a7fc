use crate::domain_model::DEFAULT_KEY_PREFIX;
use crate::token_store::MAX_PENDING;
use std::time::Duration;

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_HEALTH_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CACHE_MAX_COST: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    pub key_prefix: String,
    pub access_default_ttl: Duration,
    pub refresh_default_ttl: Duration,
    pub pending_sync_max: usize,
    pub health_period: Duration,
    pub health_ping_timeout: Duration,
    pub cache_max_cost: u64,
}

impl TokenStoreConfig {
    /// Replaces zero values with defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = TokenStoreConfig::default();
        if self.key_prefix.is_empty() {
            self.key_prefix = defaults.key_prefix;
        }
        if self.access_default_ttl.is_zero() {
            self.access_default_ttl = defaults.access_default_ttl;
        }
        if self.refresh_default_ttl.is_zero() {
            self.refresh_default_ttl = defaults.refresh_default_ttl;
        }
        if self.pending_sync_max == 0 {
            self.pending_sync_max = defaults.pending_sync_max;
        }
        if self.health_period.is_zero() {
            self.health_period = defaults.health_period;
        }
        if self.health_ping_timeout.is_zero() {
            self.health_ping_timeout = defaults.health_ping_timeout;
        }
        if self.cache_max_cost == 0 {
            self.cache_max_cost = defaults.cache_max_cost;
        }
        self
    }
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        TokenStoreConfig {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            access_default_ttl: DEFAULT_ACCESS_TTL,
            refresh_default_ttl: DEFAULT_REFRESH_TTL,
            pending_sync_max: MAX_PENDING,
            health_period: DEFAULT_HEALTH_PERIOD,
            health_ping_timeout: DEFAULT_HEALTH_PING_TIMEOUT,
            cache_max_cost: DEFAULT_CACHE_MAX_COST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = TokenStoreConfig {
            key_prefix: String::new(),
            access_default_ttl: Duration::ZERO,
            refresh_default_ttl: Duration::from_secs(60),
            pending_sync_max: 0,
            health_period: Duration::ZERO,
            health_ping_timeout: Duration::ZERO,
            cache_max_cost: 0,
        }
        .normalized();

        assert_eq!(config.key_prefix, "token");
        assert_eq!(config.access_default_ttl, DEFAULT_ACCESS_TTL);
        assert_eq!(config.refresh_default_ttl, Duration::from_secs(60));
        assert_eq!(config.pending_sync_max, 1_000_000);
        assert_eq!(config.health_period, Duration::from_secs(10));
        assert_eq!(config.health_ping_timeout, Duration::from_secs(3));
        assert_eq!(config.cache_max_cost, DEFAULT_CACHE_MAX_COST);
    }
}
