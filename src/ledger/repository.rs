use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult, LedgerError};
use crate::retry::backoff_delay;
use crate::sequence::SequenceGenerator;

/// Rows per multi-row INSERT statement in bulk paths
const INSERT_CHUNK_ROWS: usize = 2_000;

const ENTRY_COLUMNS: &str = "id, correlation_id, sequence_number, transaction_type, \
     account_type, business_id, reference_kind, reference_id, amount, \
     amount_minor_units, currency, description, metadata, posting_state, \
     effective_at, posted_at, reversal_of_id, reversed_by_id, created_at";

/// Append-only double-entry store. The source of truth for every balance in
/// the system; everything else is a cache of what this table says.
pub struct LedgerRepository {
    pool: PgPool,
    sequence: Arc<SequenceGenerator>,
    currency_divisors: HashMap<String, u32>,
}

impl LedgerRepository {
    pub fn new(
        pool: PgPool,
        sequence: Arc<SequenceGenerator>,
        currency_divisors: HashMap<String, u32>,
    ) -> Self {
        Self {
            pool,
            sequence,
            currency_divisors,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    fn divisor_for(&self, currency: &str) -> AppResult<u32> {
        self.currency_divisors
            .get(currency)
            .copied()
            .ok_or_else(|| LedgerError::UnsupportedCurrency(currency.to_string()).into())
    }

    // ========== RECORDING ==========

    /// Record one double-entry transaction: a debit and a credit with
    /// consecutive sequence numbers, written atomically, state PENDING.
    pub async fn record_transaction(&self, txn: NewTransaction) -> AppResult<EntryPair> {
        let mut tx = self.begin_tx().await?;
        let mut pairs = self.record_bulk_in_tx(&mut tx, &[txn]).await?;
        tx.commit().await?;
        // record_bulk_in_tx returns exactly one pair per input
        pairs
            .pop()
            .ok_or_else(|| AppError::Internal("bulk record returned no pair".into()))
    }

    /// Record many transactions with one sequence allocation and chunked
    /// multi-row inserts. Pure throughput optimization over
    /// `record_transaction`; semantics are identical per transaction.
    pub async fn record_bulk_transactions(
        &self,
        txns: &[NewTransaction],
    ) -> AppResult<Vec<EntryPair>> {
        let mut tx = self.begin_tx().await?;
        let pairs = self.record_bulk_in_tx(&mut tx, txns).await?;
        tx.commit().await?;
        Ok(pairs)
    }

    /// Bulk-record inside a caller-owned transaction. The bulk processor
    /// uses this so ledger writes commit in the same transaction that marks
    /// jobs succeeded.
    pub async fn record_bulk_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        txns: &[NewTransaction],
    ) -> AppResult<Vec<EntryPair>> {
        if txns.is_empty() {
            return Ok(Vec::new());
        }

        for txn in txns {
            txn.validate()?;
            self.divisor_for(&txn.currency)?;
        }

        // One counter round trip for the whole batch, on its own pool
        // connection: the counter row lock is released immediately instead
        // of being held for the life of the caller's transaction. The
        // counter is gap-tolerant, so numbers allocated to a batch that
        // later rolls back are simply never used.
        let sequence_numbers = self.sequence.next_range(txns.len() * 2).await?;

        let now = Utc::now();
        let mut rows = Vec::with_capacity(txns.len() * 2);
        for (i, txn) in txns.iter().enumerate() {
            let divisor = self.divisor_for(&txn.currency)?;
            let minor = to_minor_units(txn.amount, divisor)?;
            for (side, seq) in [
                (TransactionType::Debit, sequence_numbers[i * 2]),
                (TransactionType::Credit, sequence_numbers[i * 2 + 1]),
            ] {
                let account = match side {
                    TransactionType::Debit => txn.debit_account,
                    TransactionType::Credit => txn.credit_account,
                };
                rows.push(InsertRow {
                    id: Uuid::new_v4(),
                    correlation_id: txn.correlation_id,
                    sequence_number: seq,
                    transaction_type: side,
                    account_type: account,
                    business_id: txn.business_id,
                    reference_kind: txn.reference.map(|r| r.kind),
                    reference_id: txn.reference.map(|r| r.id),
                    amount: txn.amount,
                    amount_minor_units: minor,
                    currency: txn.currency.clone(),
                    description: txn.description.clone(),
                    metadata: txn.metadata_with_actor(),
                    effective_at: now,
                });
            }
        }

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO ledger_entries (id, correlation_id, sequence_number, \
                 transaction_type, account_type, business_id, reference_kind, \
                 reference_id, amount, amount_minor_units, currency, description, \
                 metadata, posting_state, effective_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.correlation_id)
                    .push_bind(row.sequence_number)
                    .push_bind(row.transaction_type)
                    .push_bind(row.account_type)
                    .push_bind(row.business_id)
                    .push_bind(row.reference_kind)
                    .push_bind(row.reference_id)
                    .push_bind(row.amount)
                    .push_bind(row.amount_minor_units)
                    .push_bind(row.currency.clone())
                    .push_bind(row.description.clone())
                    .push_bind(row.metadata.clone())
                    .push_bind(PostingState::Pending)
                    .push_bind(row.effective_at);
            });
            qb.build().execute(&mut **tx).await?;
        }

        // Reload what was written and hand back full records in input order
        let correlation_ids: Vec<Uuid> = txns.iter().map(|t| t.correlation_id).collect();
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE correlation_id = ANY($1) ORDER BY sequence_number"
        ))
        .bind(&correlation_ids)
        .fetch_all(&mut **tx)
        .await?;

        let mut by_correlation: HashMap<Uuid, Vec<LedgerEntry>> = HashMap::new();
        for entry in entries {
            by_correlation
                .entry(entry.correlation_id)
                .or_default()
                .push(entry);
        }

        let mut pairs = Vec::with_capacity(txns.len());
        for txn in txns {
            let group = by_correlation
                .get(&txn.correlation_id)
                .ok_or_else(|| LedgerError::PairNotFound(txn.correlation_id))?;
            pairs.push(pair_from_group(txn.correlation_id, group)?);
        }

        debug!(
            transactions = txns.len(),
            entries = txns.len() * 2,
            "Recorded bulk ledger transactions"
        );
        Ok(pairs)
    }

    // ========== LOOKUPS ==========

    pub async fn find_entry(&self, entry_id: Uuid) -> AppResult<LedgerEntry> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Ledger entry not found: {}", entry_id)))
    }

    pub async fn entries_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> AppResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE correlation_id = $1 ORDER BY sequence_number"
        ))
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    // ========== BALANCES ==========

    /// Authoritative balance: sum of debits minus credits over non-reversed
    /// entries, restricted to POSTED unless told otherwise. Offsetting
    /// reversal entries are excluded along with the originals they reverse,
    /// otherwise a reversal would be counted twice.
    pub async fn account_balance(
        &self,
        business_id: Uuid,
        account: LedgerAccount,
        only_posted: bool,
    ) -> AppResult<Decimal> {
        let balance: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(CASE WHEN transaction_type = 'debit' THEN amount ELSE -amount END) \
             FROM ledger_entries \
             WHERE business_id = $1 AND account_type = $2 \
               AND posting_state <> 'reversed' \
               AND reversal_of_id IS NULL \
               AND (NOT $3 OR posting_state = 'posted')",
        )
        .bind(business_id)
        .bind(account)
        .bind(only_posted)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Balances for many businesses in one aggregated query; used by the
    /// bulk processor's pre-lock prefetch.
    pub async fn account_balances_bulk(
        &self,
        business_ids: &[Uuid],
        account: LedgerAccount,
    ) -> AppResult<HashMap<Uuid, Decimal>> {
        if business_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT business_id, \
                    SUM(CASE WHEN transaction_type = 'debit' THEN amount ELSE -amount END) AS balance \
             FROM ledger_entries \
             WHERE business_id = ANY($1) AND account_type = $2 \
               AND posting_state = 'posted' \
               AND reversal_of_id IS NULL \
             GROUP BY business_id",
        )
        .bind(business_ids)
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        let mut balances = HashMap::with_capacity(rows.len());
        for row in rows {
            let business_id: Uuid = row.try_get("business_id")?;
            let balance: Option<Decimal> = row.try_get("balance")?;
            balances.insert(business_id, balance.unwrap_or(Decimal::ZERO));
        }
        Ok(balances)
    }

    // ========== POSTING ==========

    /// Transition every PENDING entry of a correlation to POSTED, atomically
    /// and only if the correlation balances. A correlation with zero pending
    /// entries is already-posted: success, not an error.
    pub async fn post_transaction(&self, correlation_id: Uuid) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;
        let posted = self.post_in_tx(&mut tx, correlation_id).await?;
        tx.commit().await?;
        Ok(posted)
    }

    /// Posting inside a caller-owned transaction, for flows that must commit
    /// a posting together with other writes.
    pub async fn post_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: Uuid,
    ) -> AppResult<bool> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE correlation_id = $1 ORDER BY sequence_number FOR UPDATE"
        ))
        .bind(correlation_id)
        .fetch_all(&mut **tx)
        .await?;

        if entries.is_empty() {
            return Err(LedgerError::PairNotFound(correlation_id).into());
        }
        if !entries
            .iter()
            .any(|e| e.posting_state == PostingState::Pending)
        {
            // Idempotent replay
            debug!(%correlation_id, "Correlation already posted");
            return Ok(false);
        }

        check_correlation_balanced(correlation_id, &entries)?;

        sqlx::query(
            "UPDATE ledger_entries \
             SET posting_state = 'posted', posted_at = NOW() \
             WHERE correlation_id = $1 AND posting_state = 'pending'",
        )
        .bind(correlation_id)
        .execute(&mut **tx)
        .await?;

        Ok(true)
    }

    /// Post many correlations. Each id is isolated: an unbalanced or missing
    /// correlation is reported and skipped, never aborts its siblings.
    /// Transient failures retry with exponential backoff.
    pub async fn post_bulk_transactions(
        &self,
        correlation_ids: &[Uuid],
        max_retries: u32,
    ) -> AppResult<BulkPostResult> {
        let mut result = BulkPostResult::default();

        'ids: for &correlation_id in correlation_ids {
            let mut attempt = 0u32;
            loop {
                match self.post_transaction(correlation_id).await {
                    Ok(_) => {
                        result.posted.push(correlation_id);
                        continue 'ids;
                    }
                    Err(e) if e.is_transient() && attempt + 1 < max_retries => {
                        attempt += 1;
                        warn!(%correlation_id, attempt, "Transient posting failure, retrying");
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                    Err(e) => {
                        warn!(%correlation_id, error = %e, "Posting failed");
                        result.failed.push(correlation_id);
                        result.errors.push(format!("{}: {}", correlation_id, e));
                        continue 'ids;
                    }
                }
            }
        }

        info!(
            posted = result.posted.len(),
            failed = result.failed.len(),
            "Bulk posting complete"
        );
        Ok(result)
    }

    // ========== REVERSAL ==========

    /// Reverse a transaction: mark the original pair REVERSED and write two
    /// new offsetting entries under a fresh correlation id, linked both ways
    /// through reversal_of_id / reversed_by_id. The offsetting entries are
    /// an audit record; balance queries skip them together with the
    /// originals they reverse.
    pub async fn reverse_transaction(
        &self,
        original_entry_id: Uuid,
        reason: Option<String>,
        actor: Option<String>,
    ) -> AppResult<EntryPair> {
        let new_correlation = Uuid::new_v4();
        // Allocated before the transaction; two wasted numbers on rollback
        let sequence_numbers = self.sequence.next_range(2).await?;

        let mut tx = self.begin_tx().await?;

        // Lock the whole correlation before validating, so concurrent
        // reversals of the same pair serialize here instead of both passing
        // the checks
        let correlation_id: Uuid =
            sqlx::query_scalar("SELECT correlation_id FROM ledger_entries WHERE id = $1")
                .bind(original_entry_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Ledger entry not found: {}", original_entry_id))
                })?;

        let group = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE correlation_id = $1 ORDER BY sequence_number FOR UPDATE"
        ))
        .bind(correlation_id)
        .fetch_all(&mut *tx)
        .await?;

        let (original, paired) = validate_reversal_pair(original_entry_id, &group)?;
        let now = Utc::now();

        // Offsetting entries: roles flipped, amounts preserved
        let mut new_ids = Vec::with_capacity(2);
        for (seq, source) in sequence_numbers.iter().zip([original, paired]) {
            let new_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO ledger_entries (id, correlation_id, sequence_number, \
                 transaction_type, account_type, business_id, reference_kind, reference_id, \
                 amount, amount_minor_units, currency, description, metadata, \
                 posting_state, effective_at, reversal_of_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'pending', $14, $15)",
            )
            .bind(new_id)
            .bind(new_correlation)
            .bind(seq)
            .bind(source.transaction_type.flipped())
            .bind(source.account_type)
            .bind(source.business_id)
            .bind(source.reference_kind)
            .bind(source.reference_id)
            .bind(source.amount)
            .bind(source.amount_minor_units)
            .bind(&source.currency)
            .bind(reason.clone().unwrap_or_else(|| {
                format!("Reversal of correlation {}", source.correlation_id)
            }))
            .bind(serde_json::json!({ "reversal_of": source.id }))
            .bind(now)
            .bind(source.id)
            .execute(&mut *tx)
            .await?;

            // Guarded flip: a racing reversal that slipped past the lock
            // (or a stale retry) finds the row already flipped and loses
            let flipped = sqlx::query(
                "UPDATE ledger_entries \
                 SET posting_state = 'reversed', reversed_by_id = $2 \
                 WHERE id = $1 AND posting_state <> 'reversed'",
            )
            .bind(source.id)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;
            if flipped.rows_affected() == 0 {
                return Err(LedgerError::AlreadyReversed(correlation_id).into());
            }

            new_ids.push(new_id);
        }

        sqlx::query(
            "INSERT INTO transaction_reversals \
             (kind, original_correlation_id, new_correlation_id, reason, actor) \
             VALUES ('reversal', $1, $2, $3, $4)",
        )
        .bind(correlation_id)
        .bind(new_correlation)
        .bind(&reason)
        .bind(&actor)
        .execute(&mut *tx)
        .await?;

        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE correlation_id = $1 ORDER BY sequence_number"
        ))
        .bind(new_correlation)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            original = %correlation_id,
            reversal = %new_correlation,
            "Transaction reversed"
        );
        pair_from_group(new_correlation, &entries)
    }

    // ========== VERIFICATION ==========

    /// Check the single-currency and debit==credit invariants for every
    /// correlation. Ops/test tooling, not a hot path.
    pub async fn verify_balances(
        &self,
        business_id: Option<Uuid>,
    ) -> AppResult<BalanceVerification> {
        let rows = sqlx::query(
            "SELECT correlation_id, \
                    COALESCE(SUM(amount) FILTER (WHERE transaction_type = 'debit'), 0) AS debits, \
                    COALESCE(SUM(amount) FILTER (WHERE transaction_type = 'credit'), 0) AS credits, \
                    COUNT(*) FILTER (WHERE transaction_type = 'debit') AS debit_count, \
                    COUNT(*) FILTER (WHERE transaction_type = 'credit') AS credit_count, \
                    COUNT(DISTINCT currency) AS currency_count \
             FROM ledger_entries \
             WHERE posting_state <> 'reversed' \
               AND ($1::uuid IS NULL OR business_id = $1) \
             GROUP BY correlation_id",
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        let mut issues = Vec::new();
        for row in rows {
            let correlation_id: Uuid = row.try_get("correlation_id")?;
            let debits: Decimal = row.try_get("debits")?;
            let credits: Decimal = row.try_get("credits")?;
            let debit_count: i64 = row.try_get("debit_count")?;
            let credit_count: i64 = row.try_get("credit_count")?;
            let currency_count: i64 = row.try_get("currency_count")?;

            if debit_count == 0 || credit_count == 0 {
                issues.push(BalanceIssue {
                    correlation_id,
                    problem: format!(
                        "missing side: {} debit(s), {} credit(s)",
                        debit_count, credit_count
                    ),
                });
            }
            if (debits - credits).abs() > BALANCE_TOLERANCE {
                issues.push(BalanceIssue {
                    correlation_id,
                    problem: format!("unbalanced: debits {} vs credits {}", debits, credits),
                });
            }
            if currency_count > 1 {
                issues.push(BalanceIssue {
                    correlation_id,
                    problem: format!("{} currencies in one correlation", currency_count),
                });
            }
        }

        Ok(BalanceVerification {
            balanced: issues.is_empty(),
            issues,
        })
    }
}

struct InsertRow {
    id: Uuid,
    correlation_id: Uuid,
    sequence_number: i64,
    transaction_type: TransactionType,
    account_type: LedgerAccount,
    business_id: Uuid,
    reference_kind: Option<ReferenceKind>,
    reference_id: Option<Uuid>,
    amount: Decimal,
    amount_minor_units: i64,
    currency: String,
    description: Option<String>,
    metadata: Option<serde_json::Value>,
    effective_at: chrono::DateTime<Utc>,
}

/// Locate the entry being reversed and its flipped counterpart within the
/// locked correlation group, rejecting groups that are already reversed or
/// internally inconsistent. Runs against the FOR UPDATE snapshot so the
/// verdict cannot go stale before the flip.
fn validate_reversal_pair(
    original_entry_id: Uuid,
    group: &[LedgerEntry],
) -> AppResult<(&LedgerEntry, &LedgerEntry)> {
    let original = group
        .iter()
        .find(|e| e.id == original_entry_id)
        .ok_or_else(|| AppError::NotFound(format!("Ledger entry not found: {}", original_entry_id)))?;
    let paired = group
        .iter()
        .find(|e| e.id != original.id && e.transaction_type == original.transaction_type.flipped())
        .ok_or(LedgerError::PairNotFound(original.correlation_id))?;

    if paired.currency != original.currency {
        return Err(LedgerError::CurrencyMismatch {
            correlation_id: original.correlation_id,
            left: original.currency.clone(),
            right: paired.currency.clone(),
        }
        .into());
    }
    if group
        .iter()
        .any(|e| e.posting_state == PostingState::Reversed)
    {
        return Err(LedgerError::AlreadyReversed(original.correlation_id).into());
    }

    Ok((original, paired))
}

fn pair_from_group(correlation_id: Uuid, group: &[LedgerEntry]) -> AppResult<EntryPair> {
    let debit = group
        .iter()
        .find(|e| e.transaction_type == TransactionType::Debit)
        .cloned()
        .ok_or(LedgerError::PairNotFound(correlation_id))?;
    let credit = group
        .iter()
        .find(|e| e.transaction_type == TransactionType::Credit)
        .cloned()
        .ok_or(LedgerError::PairNotFound(correlation_id))?;
    Ok(EntryPair { debit, credit })
}

/// Both sides present, amounts summing equal within tolerance, one currency.
fn check_correlation_balanced(correlation_id: Uuid, entries: &[LedgerEntry]) -> AppResult<()> {
    let debits: Decimal = entries
        .iter()
        .filter(|e| e.transaction_type == TransactionType::Debit)
        .map(|e| e.amount)
        .sum();
    let credits: Decimal = entries
        .iter()
        .filter(|e| e.transaction_type == TransactionType::Credit)
        .map(|e| e.amount)
        .sum();

    let has_debit = entries
        .iter()
        .any(|e| e.transaction_type == TransactionType::Debit);
    let has_credit = entries
        .iter()
        .any(|e| e.transaction_type == TransactionType::Credit);

    if !has_debit || !has_credit || (debits - credits).abs() > BALANCE_TOLERANCE {
        return Err(LedgerError::UnbalancedTransaction {
            correlation_id,
            debits: debits.to_string(),
            credits: credits.to_string(),
        }
        .into());
    }

    let first_currency = &entries[0].currency;
    if let Some(other) = entries.iter().find(|e| &e.currency != first_currency) {
        return Err(LedgerError::CurrencyMismatch {
            correlation_id,
            left: first_currency.clone(),
            right: other.currency.clone(),
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn entry(
        correlation_id: Uuid,
        side: TransactionType,
        amount: Decimal,
        currency: &str,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            correlation_id,
            sequence_number: 0,
            transaction_type: side,
            account_type: LedgerAccount::Escrow,
            business_id: Uuid::new_v4(),
            reference_kind: None,
            reference_id: None,
            amount,
            amount_minor_units: 0,
            currency: currency.to_string(),
            description: None,
            metadata: None,
            posting_state: PostingState::Pending,
            effective_at: Utc::now(),
            posted_at: None,
            reversal_of_id: None,
            reversed_by_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_balanced_pair_passes() {
        let id = Uuid::new_v4();
        let entries = vec![
            entry(id, TransactionType::Debit, dec!(100.00), "ZAR"),
            entry(id, TransactionType::Credit, dec!(100.00), "ZAR"),
        ];
        assert!(check_correlation_balanced(id, &entries).is_ok());
    }

    #[test]
    fn test_sub_cent_drift_within_tolerance() {
        let id = Uuid::new_v4();
        let entries = vec![
            entry(id, TransactionType::Debit, dec!(100.005), "ZAR"),
            entry(id, TransactionType::Credit, dec!(100.00), "ZAR"),
        ];
        assert!(check_correlation_balanced(id, &entries).is_ok());
    }

    #[test]
    fn test_unbalanced_pair_rejected() {
        let id = Uuid::new_v4();
        let entries = vec![
            entry(id, TransactionType::Debit, dec!(100.02), "ZAR"),
            entry(id, TransactionType::Credit, dec!(100.00), "ZAR"),
        ];
        let err = check_correlation_balanced(id, &entries).unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::UnbalancedTransaction { .. })
        ));
    }

    #[test]
    fn test_missing_side_rejected() {
        let id = Uuid::new_v4();
        let entries = vec![entry(id, TransactionType::Debit, dec!(100.00), "ZAR")];
        assert!(check_correlation_balanced(id, &entries).is_err());
    }

    #[test]
    fn test_mixed_currency_rejected() {
        let id = Uuid::new_v4();
        let entries = vec![
            entry(id, TransactionType::Debit, dec!(100.00), "ZAR"),
            entry(id, TransactionType::Credit, dec!(100.00), "USD"),
        ];
        let err = check_correlation_balanced(id, &entries).unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn test_reversal_pair_located_in_group() {
        let id = Uuid::new_v4();
        let debit = entry(id, TransactionType::Debit, dec!(100.00), "ZAR");
        let credit = entry(id, TransactionType::Credit, dec!(100.00), "ZAR");
        let group = vec![debit.clone(), credit.clone()];

        let (original, paired) = validate_reversal_pair(debit.id, &group).unwrap();
        assert_eq!(original.id, debit.id);
        assert_eq!(paired.id, credit.id);
    }

    #[test]
    fn test_reversal_of_reversed_group_rejected() {
        // Validation runs on the locked snapshot; a second reversal attempt
        // must see the flipped state and fail instead of double-offsetting
        let id = Uuid::new_v4();
        let debit = entry(id, TransactionType::Debit, dec!(100.00), "ZAR");
        let mut credit = entry(id, TransactionType::Credit, dec!(100.00), "ZAR");
        credit.posting_state = PostingState::Reversed;
        let group = vec![debit.clone(), credit];

        let err = validate_reversal_pair(debit.id, &group).unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::AlreadyReversed(_))
        ));
    }

    #[test]
    fn test_reversal_currency_mismatch_rejected() {
        let id = Uuid::new_v4();
        let debit = entry(id, TransactionType::Debit, dec!(100.00), "ZAR");
        let credit = entry(id, TransactionType::Credit, dec!(100.00), "USD");
        let group = vec![debit.clone(), credit];

        let err = validate_reversal_pair(debit.id, &group).unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn test_pair_from_group() {
        let id = Uuid::new_v4();
        let entries = vec![
            entry(id, TransactionType::Credit, dec!(10.00), "ZAR"),
            entry(id, TransactionType::Debit, dec!(10.00), "ZAR"),
        ];
        let pair = pair_from_group(id, &entries).unwrap();
        assert_eq!(pair.debit.transaction_type, TransactionType::Debit);
        assert_eq!(pair.credit.transaction_type, TransactionType::Credit);

        let only_debit = vec![entry(id, TransactionType::Debit, dec!(10.00), "ZAR")];
        assert!(pair_from_group(id, &only_debit).is_err());
    }
}
