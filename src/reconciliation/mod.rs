use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::prelude::FromRow;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::escrow::EscrowService;
use crate::ledger::{LedgerAccount, LedgerRepository};

/// Outcome of reconciling one business account
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum ReconcileOutcome {
    /// Stored balance matches the ledger exactly
    Clean,
    /// Drift within the rounding threshold; stored balance rebuilt from
    /// the ledger
    AutoHealed { delta: Decimal },
    /// Drift beyond the rounding threshold; recorded for investigation
    Flagged { delta: Decimal, froze: bool },
}

#[derive(Debug, Clone, FromRow)]
pub struct Discrepancy {
    pub id: Uuid,
    pub business_id: Uuid,
    pub stored_balance: Decimal,
    pub ledger_balance: Decimal,
    pub delta: Decimal,
    pub froze_account: bool,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Compares each business's stored escrow balance against the ledger-derived
/// one. The ledger is the source of truth: small drift (sub-cent rounding
/// residue) is healed by rebuilding the stored value; anything larger is
/// recorded, and drift past the freeze threshold also freezes the account.
pub struct ReconciliationEngine {
    pool: PgPool,
    ledger: Arc<LedgerRepository>,
    escrow: Arc<EscrowService>,
    rounding_threshold: Decimal,
    freeze_threshold: Decimal,
}

impl ReconciliationEngine {
    pub fn new(
        pool: PgPool,
        ledger: Arc<LedgerRepository>,
        escrow: Arc<EscrowService>,
        rounding_threshold: Decimal,
        freeze_threshold: Decimal,
    ) -> Self {
        Self {
            pool,
            ledger,
            escrow,
            rounding_threshold,
            freeze_threshold,
        }
    }

    pub async fn reconcile_business(&self, business_id: Uuid) -> AppResult<ReconcileOutcome> {
        let account = self.escrow.get_business(business_id).await?;
        let ledger_balance = self
            .ledger
            .account_balance(business_id, LedgerAccount::Escrow, false)
            .await?;

        let delta = account.escrow_balance - ledger_balance;
        match classify_drift(delta, self.rounding_threshold, self.freeze_threshold) {
            ReconcileOutcome::Clean => Ok(ReconcileOutcome::Clean),
            ReconcileOutcome::AutoHealed { delta } => {
                self.escrow
                    .bulk_rebuild_balances(&[(business_id, ledger_balance)])
                    .await?;
                self.record_discrepancy(
                    business_id,
                    account.escrow_balance,
                    ledger_balance,
                    delta,
                    false,
                    "auto_healed",
                )
                .await?;
                info!(%business_id, %delta, "Balance drift within tolerance; rebuilt from ledger");
                Ok(ReconcileOutcome::AutoHealed { delta })
            }
            ReconcileOutcome::Flagged { delta, froze } => {
                if froze {
                    self.escrow.freeze_business(business_id, delta).await?;
                }
                self.record_discrepancy(
                    business_id,
                    account.escrow_balance,
                    ledger_balance,
                    delta,
                    froze,
                    "open",
                )
                .await?;
                warn!(
                    %business_id,
                    stored = %account.escrow_balance,
                    ledger = %ledger_balance,
                    %delta,
                    froze,
                    "Balance discrepancy detected"
                );
                Ok(ReconcileOutcome::Flagged { delta, froze })
            }
        }
    }

    /// Full sweep over every business account.
    pub async fn reconcile_all(&self) -> AppResult<Vec<(Uuid, ReconcileOutcome)>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM business_accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut outcomes = Vec::with_capacity(ids.len());
        for (business_id,) in ids {
            let outcome = self.reconcile_business(business_id).await?;
            outcomes.push((business_id, outcome));
        }
        Ok(outcomes)
    }

    pub async fn open_discrepancies(&self) -> AppResult<Vec<Discrepancy>> {
        let rows = sqlx::query_as::<_, Discrepancy>(
            "SELECT id, business_id, stored_balance, ledger_balance, delta, \
                    froze_account, status, detected_at, resolved_at \
             FROM reconciliation_discrepancies \
             WHERE status = 'open' ORDER BY detected_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn resolve_discrepancy(&self, discrepancy_id: Uuid) -> AppResult<bool> {
        let affected = sqlx::query(
            "UPDATE reconciliation_discrepancies \
             SET status = 'resolved', resolved_at = NOW() \
             WHERE id = $1 AND status = 'open'",
        )
        .bind(discrepancy_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn record_discrepancy(
        &self,
        business_id: Uuid,
        stored: Decimal,
        ledger: Decimal,
        delta: Decimal,
        froze: bool,
        status: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO reconciliation_discrepancies \
             (business_id, stored_balance, ledger_balance, delta, froze_account, \
              status, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, \
                     CASE WHEN $6 = 'auto_healed' THEN NOW() END)",
        )
        .bind(business_id)
        .bind(stored)
        .bind(ledger)
        .bind(delta)
        .bind(froze)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Two-tier verdict on a stored-vs-ledger delta, exposed so the
    /// thresholds can be exercised without a database.
    pub fn classify(&self, delta: Decimal) -> ReconcileOutcome {
        classify_drift(delta, self.rounding_threshold, self.freeze_threshold)
    }

    /// Start the periodic full sweep (runs in background)
    pub fn start(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let engine = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                match engine.reconcile_all().await {
                    Ok(outcomes) => {
                        let flagged = outcomes
                            .iter()
                            .filter(|(_, o)| matches!(o, ReconcileOutcome::Flagged { .. }))
                            .count();
                        if flagged > 0 {
                            warn!("🔎 Reconciliation sweep: {} account(s) flagged", flagged);
                        }
                    }
                    Err(e) => error!("❌ Reconciliation sweep failed: {:?}", e),
                }
            }
        })
    }
}

/// Drift verdict: exact match is clean, drift within the rounding threshold
/// heals silently, anything larger is flagged, and drift past the freeze
/// threshold also stops the account. Sign of the delta never matters.
fn classify_drift(
    delta: Decimal,
    rounding_threshold: Decimal,
    freeze_threshold: Decimal,
) -> ReconcileOutcome {
    if delta.is_zero() {
        ReconcileOutcome::Clean
    } else if delta.abs() <= rounding_threshold {
        ReconcileOutcome::AutoHealed { delta }
    } else {
        ReconcileOutcome::Flagged {
            delta,
            froze: delta.abs() > freeze_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ROUNDING: Decimal = dec!(0.01);
    const FREEZE: Decimal = dec!(1.00);

    #[test]
    fn test_exact_match_is_clean() {
        assert_eq!(
            classify_drift(dec!(0), ROUNDING, FREEZE),
            ReconcileOutcome::Clean
        );
    }

    #[test]
    fn test_sub_cent_drift_auto_heals() {
        assert_eq!(
            classify_drift(dec!(0.005), ROUNDING, FREEZE),
            ReconcileOutcome::AutoHealed { delta: dec!(0.005) }
        );
        assert_eq!(
            classify_drift(dec!(-0.005), ROUNDING, FREEZE),
            ReconcileOutcome::AutoHealed {
                delta: dec!(-0.005)
            }
        );
    }

    #[test]
    fn test_moderate_drift_flagged_without_freeze() {
        assert_eq!(
            classify_drift(dec!(0.50), ROUNDING, FREEZE),
            ReconcileOutcome::Flagged {
                delta: dec!(0.50),
                froze: false,
            }
        );
    }

    #[test]
    fn test_large_drift_flagged_and_frozen() {
        assert_eq!(
            classify_drift(dec!(2.00), ROUNDING, FREEZE),
            ReconcileOutcome::Flagged {
                delta: dec!(2.00),
                froze: true,
            }
        );
        assert_eq!(
            classify_drift(dec!(-2.00), ROUNDING, FREEZE),
            ReconcileOutcome::Flagged {
                delta: dec!(-2.00),
                froze: true,
            }
        );
    }

    #[test]
    fn test_thresholds_are_inclusive_boundaries() {
        // At exactly the rounding threshold we heal; at exactly the freeze
        // threshold we flag without freezing
        assert_eq!(
            classify_drift(ROUNDING, ROUNDING, FREEZE),
            ReconcileOutcome::AutoHealed { delta: ROUNDING }
        );
        assert_eq!(
            classify_drift(FREEZE, ROUNDING, FREEZE),
            ReconcileOutcome::Flagged {
                delta: FREEZE,
                froze: false,
            }
        );
    }
}
