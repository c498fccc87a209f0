use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Cached available balance with timestamp
#[derive(Debug, Clone, Copy)]
pub struct CachedBalance {
    pub available: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Short-TTL in-memory cache of available balances per business.
///
/// Only ever consulted before the business row lock is taken; the locked row
/// is the authority. A stale value here costs a skipped fast path or an
/// extra log line, never an approval.
pub struct BalanceCache {
    cache: RwLock<HashMap<Uuid, CachedBalance>>,
    ttl_ms: u64,
}

impl BalanceCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl_ms,
        }
    }

    pub async fn get(&self, business_id: Uuid) -> Option<Decimal> {
        let cache = self.cache.read().await;
        let entry = cache.get(&business_id)?;
        if self.is_fresh(entry) {
            debug!(%business_id, "Balance cache hit");
            Some(entry.available)
        } else {
            None
        }
    }

    pub async fn set(&self, business_id: Uuid, available: Decimal) {
        let mut cache = self.cache.write().await;
        cache.insert(
            business_id,
            CachedBalance {
                available,
                timestamp: Utc::now(),
            },
        );
    }

    /// Drop the cached value after any balance mutation
    pub async fn invalidate(&self, business_id: Uuid) {
        let mut cache = self.cache.write().await;
        cache.remove(&business_id);
    }

    pub async fn cleanup_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl_ms = self.ttl_ms as i64;
        cache.retain(|_, entry| (Utc::now() - entry.timestamp).num_milliseconds() < ttl_ms);
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired balance cache entries");
        }
    }

    pub async fn size(&self) -> usize {
        self.cache.read().await.len()
    }

    fn is_fresh(&self, entry: &CachedBalance) -> bool {
        (Utc::now() - entry.timestamp).num_milliseconds() < self.ttl_ms as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_cache_hit_and_invalidate() {
        let cache = BalanceCache::new(5_000);
        let business_id = Uuid::new_v4();

        assert!(cache.get(business_id).await.is_none());

        cache.set(business_id, dec!(1_000.00)).await;
        assert_eq!(cache.get(business_id).await, Some(dec!(1_000.00)));

        cache.invalidate(business_id).await;
        assert!(cache.get(business_id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let cache = BalanceCache::new(0);
        let business_id = Uuid::new_v4();

        cache.set(business_id, dec!(50.00)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get(business_id).await.is_none());

        cache.cleanup_expired().await;
        assert_eq!(cache.size().await, 0);
    }
}
