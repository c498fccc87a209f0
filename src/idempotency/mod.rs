use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::AppResult;

/// Outcome of attempting to claim a named operation
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// First caller; proceed and record a result
    Acquired,
    /// A prior invocation finished; its stored result
    Completed(serde_json::Value),
    /// Another invocation holds the key and has not finished
    InFlight,
}

/// Persisted idempotency keys. Wrapping an operation (e.g. "settle window
/// N") in claim/complete makes repeated invocation a no-op after first
/// success.
pub struct IdempotencyStore {
    pool: PgPool,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn try_claim(&self, key: &str, ttl_hours: i64) -> AppResult<Claim> {
        let expires_at = Utc::now() + Duration::hours(ttl_hours);

        // Reclaim an expired key first so a dead claim cannot wedge the
        // operation forever
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND expires_at < NOW()")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO idempotency_keys (key, expires_at) VALUES ($1, $2) \
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Claim::Acquired);
        }

        let row = sqlx::query(
            "SELECT result, completed_at FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let completed: Option<chrono::DateTime<Utc>> = row.try_get("completed_at")?;
                if completed.is_some() {
                    let result: Option<serde_json::Value> = row.try_get("result")?;
                    debug!(key, "Idempotent replay: returning stored result");
                    Ok(Claim::Completed(result.unwrap_or(serde_json::Value::Null)))
                } else {
                    Ok(Claim::InFlight)
                }
            }
            // Key vanished between insert and select; treat as in flight and
            // let the caller retry
            None => Ok(Claim::InFlight),
        }
    }

    pub async fn complete(&self, key: &str, result: &serde_json::Value) -> AppResult<()> {
        sqlx::query(
            "UPDATE idempotency_keys SET result = $2, completed_at = NOW() WHERE key = $1",
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop a claim after a failed run so a retry can reprocess.
    pub async fn release(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND completed_at IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn purge_expired(&self) -> AppResult<u64> {
        let purged = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(purged)
    }
}
