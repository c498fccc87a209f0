use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    /// Minor-unit divisor per supported currency (100 = cents)
    pub currency_divisors: HashMap<String, u32>,
    pub default_currency: String,
    /// Balance cache TTL in milliseconds
    pub balance_cache_ttl_ms: u64,
    /// Jobs stuck in processing longer than this are reset to pending
    pub stuck_job_threshold_minutes: i64,
    /// Settlement windows stuck in processing longer than this are reset
    /// to pending and re-swept
    pub stuck_window_threshold_minutes: i64,
    /// Reconciliation: drift at or below this is rebuilt silently
    pub rounding_threshold: Decimal,
    /// Reconciliation: drift above this freezes the account
    pub freeze_threshold: Decimal,
    /// Settlement window idempotency key lifetime in hours
    pub idempotency_ttl_hours: i64,
    /// Settlement sweep interval in seconds
    pub settlement_tick_secs: u64,
    /// Recovery sweep interval in seconds
    pub recovery_interval_secs: u64,
    /// Reconciliation sweep interval in seconds
    pub reconciliation_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut currency_divisors = HashMap::new();
        currency_divisors.insert("ZAR".to_string(), 100);
        currency_divisors.insert("USD".to_string(), 100);
        currency_divisors.insert("GBP".to_string(), 100);

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/payroll".to_string()),
            currency_divisors,
            default_currency: std::env::var("DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "ZAR".to_string()),
            balance_cache_ttl_ms: env_parsed("BALANCE_CACHE_TTL_MS", 5_000),
            stuck_job_threshold_minutes: env_parsed("STUCK_JOB_THRESHOLD_MINUTES", 30),
            stuck_window_threshold_minutes: env_parsed("STUCK_WINDOW_THRESHOLD_MINUTES", 30),
            rounding_threshold: dec!(0.01),
            freeze_threshold: dec!(1.00),
            idempotency_ttl_hours: env_parsed("IDEMPOTENCY_TTL_HOURS", 24),
            settlement_tick_secs: env_parsed("SETTLEMENT_TICK_SECS", 60),
            recovery_interval_secs: env_parsed("RECOVERY_INTERVAL_SECS", 300),
            reconciliation_interval_secs: env_parsed("RECONCILIATION_INTERVAL_SECS", 3600),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.currency_divisors.get("ZAR"), Some(&100));
        assert_eq!(config.rounding_threshold, dec!(0.01));
        assert!(config.freeze_threshold > config.rounding_threshold);
    }
}
