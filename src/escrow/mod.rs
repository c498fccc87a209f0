pub mod cache;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use cache::BalanceCache;
pub use models::*;

use crate::error::{AppResult, EscrowError};
use crate::events::{DomainEvent, EventBus};
use crate::ledger::{
    EntryReference, LedgerAccount, LedgerRepository, NewTransaction, ReferenceKind,
};

const BUSINESS_COLUMNS: &str =
    "id, name, escrow_balance, hold_amount, is_frozen, created_at, updated_at";

/// Validates and reserves available balance against pending jobs.
///
/// Lock ordering across the whole engine is business -> job -> deposit; this
/// service only ever touches the business row, always first.
pub struct EscrowService {
    pool: PgPool,
    ledger: Arc<LedgerRepository>,
    cache: Arc<BalanceCache>,
    events: EventBus,
}

impl EscrowService {
    pub fn new(
        pool: PgPool,
        ledger: Arc<LedgerRepository>,
        cache: Arc<BalanceCache>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            ledger,
            cache,
            events,
        }
    }

    pub fn cache(&self) -> &BalanceCache {
        &self.cache
    }

    // ========== BALANCE READS ==========

    pub async fn get_business(&self, business_id: Uuid) -> AppResult<BusinessAccount> {
        sqlx::query_as::<_, BusinessAccount>(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM business_accounts WHERE id = $1"
        ))
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EscrowError::BusinessNotFound(business_id).into())
    }

    /// Ledger-derived posted ESCROW balance minus hold_amount, cache-first.
    pub async fn available_balance(&self, business_id: Uuid) -> AppResult<Decimal> {
        if let Some(cached) = self.cache.get(business_id).await {
            return Ok(cached);
        }

        let posted = self
            .ledger
            .account_balance(business_id, LedgerAccount::Escrow, true)
            .await?;
        let account = self.get_business(business_id).await?;
        let available = posted - account.hold_amount;

        self.cache.set(business_id, available).await;
        Ok(available)
    }

    /// Prefetch available balances for a batch of businesses: cache hits
    /// first, one aggregated ledger query plus one account query for the
    /// rest.
    pub async fn available_balances_bulk(
        &self,
        business_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Decimal>> {
        let mut balances = HashMap::with_capacity(business_ids.len());
        let mut uncached = Vec::new();

        for &business_id in business_ids {
            match self.cache.get(business_id).await {
                Some(available) => {
                    balances.insert(business_id, available);
                }
                None => uncached.push(business_id),
            }
        }

        if uncached.is_empty() {
            return Ok(balances);
        }

        let posted = self
            .ledger
            .account_balances_bulk(&uncached, LedgerAccount::Escrow)
            .await?;

        let rows = sqlx::query(
            "SELECT id, hold_amount FROM business_accounts WHERE id = ANY($1)",
        )
        .bind(&uncached)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let hold: Decimal = row.try_get("hold_amount")?;
            let available = posted.get(&id).copied().unwrap_or(Decimal::ZERO) - hold;
            self.cache.set(id, available).await;
            balances.insert(id, available);
        }

        Ok(balances)
    }

    // ========== ROW LOCKING ==========

    /// Non-blocking row lock on the business. `None` means a concurrent
    /// batch holds the row; the caller yields and moves on instead of
    /// waiting.
    pub async fn try_lock_business(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
    ) -> AppResult<Option<BusinessAccount>> {
        let account = sqlx::query_as::<_, BusinessAccount>(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM business_accounts \
             WHERE id = $1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(business_id)
        .fetch_optional(&mut **tx)
        .await?;

        if account.is_none() {
            // Distinguish "locked" from "does not exist"
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM business_accounts WHERE id = $1)",
            )
            .bind(business_id)
            .fetch_one(&mut **tx)
            .await?;
            if !exists {
                return Err(EscrowError::BusinessNotFound(business_id).into());
            }
            debug!(%business_id, "Business row locked by a concurrent batch, skipping");
        }

        Ok(account)
    }

    // ========== RESERVATION ==========

    /// Reserve funds for a batch of jobs under one business. All-or-nothing
    /// per business: either the aggregate fits in available balance and all
    /// jobs reserve, or none do.
    pub async fn reserve_funds_bulk(
        &self,
        business_id: Uuid,
        requests: &[ReservationRequest],
    ) -> AppResult<Vec<ReservationResult>> {
        let mut tx = self.pool.begin().await?;

        let account = match self.try_lock_business(&mut tx, business_id).await? {
            Some(account) => account,
            None => return Err(EscrowError::BusinessBusy(business_id).into()),
        };

        let results = self.reserve_in_tx(&mut tx, &account, requests).await?;
        tx.commit().await?;
        self.cache.invalidate(business_id).await;
        Ok(results)
    }

    /// Reservation step for callers that already hold the business row lock.
    /// The guarded UPDATE re-checks available balance at the storage layer,
    /// so the gate holds even if the caller's snapshot is stale.
    pub async fn reserve_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account: &BusinessAccount,
        requests: &[ReservationRequest],
    ) -> AppResult<Vec<ReservationResult>> {
        if account.is_frozen {
            return Err(EscrowError::AccountFrozen(account.id).into());
        }

        let total: Decimal = requests.iter().map(|r| r.amount).sum();

        let updated = sqlx::query(
            "UPDATE business_accounts \
             SET hold_amount = hold_amount + $2, updated_at = NOW() \
             WHERE id = $1 AND (escrow_balance - hold_amount) >= $2",
        )
        .bind(account.id)
        .bind(total)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        let results = if updated == 0 {
            warn!(
                business_id = %account.id,
                required = %total,
                available = %account.available(),
                "Bulk reservation rejected: insufficient available balance"
            );
            requests
                .iter()
                .map(|r| ReservationResult {
                    job_id: r.job_id,
                    success: false,
                    error: Some(format!(
                        "insufficient balance: required {}, available {}",
                        total,
                        account.available()
                    )),
                })
                .collect()
        } else {
            requests
                .iter()
                .map(|r| ReservationResult {
                    job_id: r.job_id,
                    success: true,
                    error: None,
                })
                .collect()
        };

        Ok(results)
    }

    /// Convert a reservation into a settlement: the held amount leaves both
    /// the hold and the cached balance.
    pub async fn apply_settlement_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
        total: Decimal,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE business_accounts \
             SET escrow_balance = escrow_balance - $2, \
                 hold_amount = hold_amount - $2, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(business_id)
        .bind(total)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Release a hold without settling (reservation succeeded but the jobs
    /// did not).
    pub async fn release_hold_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
        total: Decimal,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE business_accounts \
             SET hold_amount = hold_amount - $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(business_id)
        .bind(total)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    // ========== DEPOSITS ==========

    /// Fund a business account: BANK -> ESCROW double entry, posted
    /// immediately, cached balance bumped. One transaction end to end, so a
    /// crash never leaves ledger entries without the matching stored
    /// balance (or the reverse).
    pub async fn record_deposit(
        &self,
        business_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> AppResult<EscrowDeposit> {
        let deposit_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        self.ledger
            .record_bulk_in_tx(
                &mut tx,
                &[deposit_payload(business_id, deposit_id, correlation_id, amount, currency)],
            )
            .await?;
        self.ledger.post_in_tx(&mut tx, correlation_id).await?;

        // Business row before deposit row, per lock ordering
        let account = sqlx::query_as::<_, BusinessAccount>(&format!(
            "UPDATE business_accounts \
             SET escrow_balance = escrow_balance + $2, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {BUSINESS_COLUMNS}"
        ))
        .bind(business_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(EscrowError::BusinessNotFound(business_id))?;

        let deposit = sqlx::query_as::<_, EscrowDeposit>(
            "INSERT INTO escrow_deposits (id, business_id, amount, currency, correlation_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, business_id, amount, currency, correlation_id, created_at",
        )
        .bind(deposit_id)
        .bind(business_id)
        .bind(amount)
        .bind(currency)
        .bind(correlation_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.cache.invalidate(business_id).await;
        self.events.emit(DomainEvent::BalanceUpdated {
            business_id,
            escrow_balance: account.escrow_balance,
        });

        info!(%business_id, %amount, currency, "Escrow deposit recorded");
        Ok(deposit)
    }

    // ========== BULK BALANCE UPDATER ==========

    /// Rebuild many cached balances in one CASE-based statement instead of
    /// one UPDATE per business.
    pub async fn bulk_rebuild_balances(
        &self,
        balances: &[(Uuid, Decimal)],
    ) -> AppResult<u64> {
        if balances.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE business_accounts SET escrow_balance = CASE id ",
        );
        for (business_id, balance) in balances {
            qb.push("WHEN ")
                .push_bind(business_id)
                .push(" THEN ")
                .push_bind(balance)
                .push(" ");
        }
        qb.push("ELSE escrow_balance END, updated_at = NOW() WHERE id IN (");
        let mut separated = qb.separated(", ");
        for (business_id, _) in balances {
            separated.push_bind(business_id);
        }
        separated.push_unseparated(")");

        let affected = qb.build().execute(&self.pool).await?.rows_affected();

        for (business_id, _) in balances {
            self.cache.invalidate(*business_id).await;
        }
        Ok(affected)
    }

    /// Freeze an account to stop further movement. Unfreezing is a manual
    /// operator action.
    pub async fn freeze_business(&self, business_id: Uuid, delta: Decimal) -> AppResult<()> {
        sqlx::query(
            "UPDATE business_accounts SET is_frozen = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(business_id)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(business_id).await;
        self.events
            .emit(DomainEvent::AccountFrozen { business_id, delta });
        warn!(%business_id, %delta, "Business account frozen");
        Ok(())
    }

    pub async fn create_business(&self, name: &str) -> AppResult<BusinessAccount> {
        let account = sqlx::query_as::<_, BusinessAccount>(&format!(
            "INSERT INTO business_accounts (name) VALUES ($1) RETURNING {BUSINESS_COLUMNS}"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }
}

/// Funding double entry: money arrives from the bank into escrow.
fn deposit_payload(
    business_id: Uuid,
    deposit_id: Uuid,
    correlation_id: Uuid,
    amount: Decimal,
    currency: &str,
) -> NewTransaction {
    NewTransaction {
        correlation_id,
        debit_account: LedgerAccount::Escrow,
        credit_account: LedgerAccount::Bank,
        business_id,
        amount,
        currency: currency.to_string(),
        description: Some("Escrow deposit".to_string()),
        reference: Some(EntryReference {
            kind: ReferenceKind::EscrowDeposit,
            id: deposit_id,
        }),
        metadata: None,
        actor: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_deposit_payload_directions() {
        let business_id = Uuid::new_v4();
        let deposit_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let txn = deposit_payload(business_id, deposit_id, correlation_id, dec!(500.00), "ZAR");

        assert_eq!(txn.debit_account, LedgerAccount::Escrow);
        assert_eq!(txn.credit_account, LedgerAccount::Bank);
        assert_eq!(txn.correlation_id, correlation_id);
        assert_eq!(
            txn.reference,
            Some(EntryReference {
                kind: ReferenceKind::EscrowDeposit,
                id: deposit_id,
            })
        );
        assert!(txn.validate().is_ok());
    }
}
