use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppResult, LedgerError};
use crate::escrow::EscrowService;
use crate::events::{DomainEvent, EventBus};
use crate::ledger::{
    EntryPair, EntryReference, LedgerAccount, LedgerEntry, LedgerRepository, NewTransaction,
    PostingState, ReferenceKind,
};

/// Undoes completed transactions two ways. A reversal marks the original
/// pair REVERSED and writes offsetting entries linked to it. A compensation
/// leaves the original untouched and books an independent correcting pair,
/// so the history reads as two real movements rather than an erasure.
///
/// Both paths change what the ledger says a business holds, so both finish
/// by rebuilding the stored escrow balance from the ledger. Skipping that
/// would leave a drift for reconciliation to flag on a perfectly healthy
/// account.
pub struct ReversalEngine {
    pool: PgPool,
    ledger: Arc<LedgerRepository>,
    escrow: Arc<EscrowService>,
    events: EventBus,
}

impl ReversalEngine {
    pub fn new(
        pool: PgPool,
        ledger: Arc<LedgerRepository>,
        escrow: Arc<EscrowService>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            ledger,
            escrow,
            events,
        }
    }

    /// Reverse the transaction containing this entry. Fails with
    /// AlreadyReversed on a second attempt.
    pub async fn reverse(
        &self,
        entry_id: Uuid,
        reason: Option<String>,
        actor: Option<String>,
    ) -> AppResult<EntryPair> {
        let pair = self.ledger.reverse_transaction(entry_id, reason, actor).await?;
        self.rebuild_stored_balance(pair.debit.business_id).await?;
        Ok(pair)
    }

    /// Book a correcting pair against a completed transaction. The original
    /// stays POSTED; the correction is a first-class transaction tied to the
    /// original through its compensation chain. A correlation that has been
    /// reversed cannot also be compensated.
    pub async fn compensate(
        &self,
        original_correlation_id: Uuid,
        reason: Option<String>,
        actor: Option<String>,
    ) -> AppResult<EntryPair> {
        let group = self
            .ledger
            .entries_for_correlation(original_correlation_id)
            .await?;
        if group.is_empty() {
            return Err(LedgerError::PairNotFound(original_correlation_id).into());
        }
        if group
            .iter()
            .any(|e| e.posting_state == PostingState::Reversed)
        {
            return Err(LedgerError::AlreadyReversed(original_correlation_id).into());
        }

        let debit = group
            .iter()
            .find(|e| e.transaction_type == crate::ledger::TransactionType::Debit)
            .ok_or(LedgerError::PairNotFound(original_correlation_id))?;
        let credit = group
            .iter()
            .find(|e| e.transaction_type == crate::ledger::TransactionType::Credit)
            .ok_or(LedgerError::PairNotFound(original_correlation_id))?;
        if debit.currency != credit.currency {
            return Err(LedgerError::CurrencyMismatch {
                correlation_id: original_correlation_id,
                left: debit.currency.clone(),
                right: credit.currency.clone(),
            }
            .into());
        }

        let chain_id = compensation_chain_id(debit);
        let txn = compensation_payload(debit, credit, reason.clone(), actor.clone(), chain_id);
        let new_correlation = txn.correlation_id;

        let pair = self.ledger.record_transaction(txn).await?;
        self.ledger.post_transaction(new_correlation).await?;

        sqlx::query(
            "INSERT INTO transaction_reversals \
             (kind, original_correlation_id, new_correlation_id, \
              compensation_chain_id, reason, actor) \
             VALUES ('compensation', $1, $2, $3, $4, $5)",
        )
        .bind(original_correlation_id)
        .bind(new_correlation)
        .bind(chain_id)
        .bind(&reason)
        .bind(&actor)
        .execute(&self.pool)
        .await?;

        self.rebuild_stored_balance(pair.debit.business_id).await?;
        info!(
            original = %original_correlation_id,
            compensation = %new_correlation,
            chain = %chain_id,
            "Compensation booked"
        );
        Ok(pair)
    }

    /// The ledger just changed shape; bring the stored balance back in line
    /// with it and tell subscribers.
    async fn rebuild_stored_balance(&self, business_id: Uuid) -> AppResult<()> {
        let escrow_balance = self
            .ledger
            .account_balance(business_id, LedgerAccount::Escrow, false)
            .await?;
        self.escrow
            .bulk_rebuild_balances(&[(business_id, escrow_balance)])
            .await?;
        self.events.emit(DomainEvent::BalanceUpdated {
            business_id,
            escrow_balance,
        });
        Ok(())
    }
}

/// Chain id grouping an original transaction with every compensation made
/// against it (and compensations of those): an existing chain propagates,
/// otherwise the original correlation starts one.
fn compensation_chain_id(entry: &LedgerEntry) -> Uuid {
    entry
        .metadata
        .as_ref()
        .and_then(|m| m.get("compensation_chain_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or(entry.correlation_id)
}

/// The correcting transaction: roles flipped, amount preserved, fresh
/// correlation, chained back to the original through metadata.
fn compensation_payload(
    debit: &LedgerEntry,
    credit: &LedgerEntry,
    reason: Option<String>,
    actor: Option<String>,
    chain_id: Uuid,
) -> NewTransaction {
    NewTransaction {
        correlation_id: Uuid::new_v4(),
        debit_account: credit.account_type,
        credit_account: debit.account_type,
        business_id: debit.business_id,
        amount: debit.amount,
        currency: debit.currency.clone(),
        description: Some(reason.unwrap_or_else(|| {
            format!("Compensation for correlation {}", debit.correlation_id)
        })),
        reference: Some(EntryReference {
            kind: ReferenceKind::Adjustment,
            id: debit.correlation_id,
        }),
        metadata: Some(serde_json::json!({
            "compensation_of": debit.correlation_id,
            "compensation_chain_id": chain_id,
        })),
        actor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerAccount, TransactionType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn entry(
        correlation_id: Uuid,
        transaction_type: TransactionType,
        account_type: LedgerAccount,
        metadata: Option<serde_json::Value>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            correlation_id,
            sequence_number: 1,
            transaction_type,
            account_type,
            business_id: Uuid::new_v4(),
            reference_kind: None,
            reference_id: None,
            amount: dec!(150.00),
            amount_minor_units: 15_000,
            currency: "ZAR".to_string(),
            description: None,
            metadata,
            posting_state: PostingState::Posted,
            effective_at: Utc::now(),
            posted_at: Some(Utc::now()),
            reversal_of_id: None,
            reversed_by_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_compensation_flips_roles_and_keeps_amount() {
        let correlation = Uuid::new_v4();
        let debit = entry(correlation, TransactionType::Debit, LedgerAccount::Payroll, None);
        let credit = entry(correlation, TransactionType::Credit, LedgerAccount::Escrow, None);

        let txn = compensation_payload(&debit, &credit, None, None, correlation);

        assert_eq!(txn.debit_account, LedgerAccount::Escrow);
        assert_eq!(txn.credit_account, LedgerAccount::Payroll);
        assert_eq!(txn.amount, dec!(150.00));
        assert_ne!(txn.correlation_id, correlation);
        assert_eq!(
            txn.reference,
            Some(EntryReference {
                kind: ReferenceKind::Adjustment,
                id: correlation,
            })
        );
    }

    #[test]
    fn test_chain_id_starts_at_original() {
        let correlation = Uuid::new_v4();
        let debit = entry(correlation, TransactionType::Debit, LedgerAccount::Payroll, None);
        assert_eq!(compensation_chain_id(&debit), correlation);
    }

    #[test]
    fn test_chain_id_propagates_through_compensations() {
        let chain = Uuid::new_v4();
        let debit = entry(
            Uuid::new_v4(),
            TransactionType::Debit,
            LedgerAccount::Escrow,
            Some(serde_json::json!({ "compensation_chain_id": chain.to_string() })),
        );
        assert_eq!(compensation_chain_id(&debit), chain);
    }
}
