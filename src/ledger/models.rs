use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::error::{AppError, AppResult, LedgerError};

/// Tolerance for the debit == credit check. Comparisons absorb rounding
/// noise up to one cent; never exact equality.
pub const BALANCE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Which side of a double entry this row is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Debit,
    Credit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "debit",
            TransactionType::Credit => "credit",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            TransactionType::Debit => TransactionType::Credit,
            TransactionType::Credit => TransactionType::Debit,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accounts money can move between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_account", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerAccount {
    Escrow,
    Payroll,
    Payment,
    Fees,
    Taxes,
    Bank,
}

impl LedgerAccount {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAccount::Escrow => "escrow",
            LedgerAccount::Payroll => "payroll",
            LedgerAccount::Payment => "payment",
            LedgerAccount::Fees => "fees",
            LedgerAccount::Taxes => "taxes",
            LedgerAccount::Bank => "bank",
        }
    }
}

impl fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Posting lifecycle of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "posting_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PostingState {
    Pending,
    Posted,
    Reversed,
}

impl PostingState {
    /// Valid transitions:
    /// - Pending -> Posted, Reversed
    /// - Posted -> Reversed
    /// - Reversed is terminal
    pub fn can_transition_to(&self, to: PostingState) -> bool {
        matches!(
            (self, to),
            (PostingState::Pending, PostingState::Posted)
                | (PostingState::Pending, PostingState::Reversed)
                | (PostingState::Posted, PostingState::Reversed)
        )
    }

    pub fn validate_transition(&self, to: PostingState) -> AppResult<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }
        Err(LedgerError::InvalidStateTransition {
            current: format!("{:?}", self),
            attempted: format!("{:?}", to),
        }
        .into())
    }
}

/// What caused a ledger entry. Tagged kind + id instead of free-form
/// type-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reference_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    PayrollJob,
    PaymentJob,
    EscrowDeposit,
    Adjustment,
}

/// Reference to the job/deposit behind an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReference {
    pub kind: ReferenceKind,
    pub id: Uuid,
}

/// One side (debit or credit) of a transaction
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub sequence_number: i64,
    pub transaction_type: TransactionType,
    pub account_type: LedgerAccount,
    pub business_id: Uuid,
    pub reference_kind: Option<ReferenceKind>,
    pub reference_id: Option<Uuid>,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub amount_minor_units: i64,
    pub currency: String,

    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub posting_state: PostingState,
    pub effective_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub reversal_of_id: Option<Uuid>,
    pub reversed_by_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed contribution to an account balance: debits add, credits
    /// subtract. Reversed entries contribute nothing, and neither do their
    /// offsetting audit entries (reversal_of_id set) — counting the offset
    /// while also excluding the original would undo the reversal twice.
    pub fn signed_amount(&self) -> Decimal {
        if self.posting_state == PostingState::Reversed || self.reversal_of_id.is_some() {
            return Decimal::ZERO;
        }
        match self.transaction_type {
            TransactionType::Debit => self.amount,
            TransactionType::Credit => -self.amount,
        }
    }
}

/// A matched debit/credit pair returned from record/reverse operations
#[derive(Debug, Clone, Serialize)]
pub struct EntryPair {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

impl EntryPair {
    pub fn correlation_id(&self) -> Uuid {
        self.debit.correlation_id
    }
}

/// Input for one double-entry transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub correlation_id: Uuid,
    pub debit_account: LedgerAccount,
    pub credit_account: LedgerAccount,
    pub business_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub reference: Option<EntryReference>,
    pub metadata: Option<serde_json::Value>,
    /// Who initiated this movement; recorded in entry metadata
    pub actor: Option<String>,
}

impl NewTransaction {
    pub fn validate(&self) -> AppResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(self.amount.to_string()).into());
        }
        if self.debit_account == self.credit_account {
            return Err(LedgerError::SameAccount(self.debit_account).into());
        }
        Ok(())
    }

    /// Metadata to persist: caller metadata with the actor folded in.
    pub fn metadata_with_actor(&self) -> Option<serde_json::Value> {
        match (&self.metadata, &self.actor) {
            (metadata, None) => metadata.clone(),
            (Some(serde_json::Value::Object(map)), Some(actor)) => {
                let mut map = map.clone();
                map.insert("actor".to_string(), serde_json::Value::String(actor.clone()));
                Some(serde_json::Value::Object(map))
            }
            (_, Some(actor)) => Some(serde_json::json!({ "actor": actor })),
        }
    }
}

/// Convert a decimal amount to integer minor units using the per-currency
/// divisor, rounding half up.
pub fn to_minor_units(amount: Decimal, divisor: u32) -> AppResult<i64> {
    let scaled = (amount * Decimal::from(divisor))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled
        .to_i64()
        .ok_or_else(|| AppError::InvalidInput(format!("Amount out of range: {}", amount)))
}

/// Result of verify_balances: every invariant violation found in the store
#[derive(Debug, Clone, Serialize)]
pub struct BalanceVerification {
    pub balanced: bool,
    pub issues: Vec<BalanceIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceIssue {
    pub correlation_id: Uuid,
    pub problem: String,
}

/// Outcome of a bulk posting call
#[derive(Debug, Clone, Serialize, Default)]
pub struct BulkPostResult {
    pub posted: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_units_round_half_up() {
        assert_eq!(to_minor_units(dec!(10.00), 100).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(10.005), 100).unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(10.004), 100).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(0.01), 100).unwrap(), 1);
    }

    #[test]
    fn test_posting_state_machine() {
        assert!(PostingState::Pending.can_transition_to(PostingState::Posted));
        assert!(PostingState::Pending.can_transition_to(PostingState::Reversed));
        assert!(PostingState::Posted.can_transition_to(PostingState::Reversed));

        // never backward, reversed is terminal
        assert!(!PostingState::Posted.can_transition_to(PostingState::Pending));
        assert!(!PostingState::Reversed.can_transition_to(PostingState::Pending));
        assert!(!PostingState::Reversed.can_transition_to(PostingState::Posted));
    }

    #[test]
    fn test_new_transaction_validation() {
        let mut txn = NewTransaction {
            correlation_id: Uuid::new_v4(),
            debit_account: LedgerAccount::Escrow,
            credit_account: LedgerAccount::Payroll,
            business_id: Uuid::new_v4(),
            amount: dec!(100.00),
            currency: "ZAR".to_string(),
            description: None,
            reference: None,
            metadata: None,
            actor: None,
        };
        assert!(txn.validate().is_ok());

        txn.amount = dec!(0);
        assert!(txn.validate().is_err());

        txn.amount = dec!(-5.00);
        assert!(txn.validate().is_err());

        txn.amount = dec!(100.00);
        txn.credit_account = LedgerAccount::Escrow;
        assert!(txn.validate().is_err());
    }

    #[test]
    fn test_signed_amount_excludes_reversed() {
        let mut entry = LedgerEntry {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            sequence_number: 1,
            transaction_type: TransactionType::Debit,
            account_type: LedgerAccount::Escrow,
            business_id: Uuid::new_v4(),
            reference_kind: None,
            reference_id: None,
            amount: dec!(50.00),
            amount_minor_units: 5000,
            currency: "ZAR".to_string(),
            description: None,
            metadata: None,
            posting_state: PostingState::Posted,
            effective_at: Utc::now(),
            posted_at: Some(Utc::now()),
            reversal_of_id: None,
            reversed_by_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(entry.signed_amount(), dec!(50.00));

        entry.transaction_type = TransactionType::Credit;
        assert_eq!(entry.signed_amount(), dec!(-50.00));

        entry.posting_state = PostingState::Reversed;
        assert_eq!(entry.signed_amount(), Decimal::ZERO);
    }

    #[test]
    fn test_reversal_returns_balance_to_pre_transaction_value() {
        // A settled payout seen from ESCROW: one posted credit. Reversing
        // marks it REVERSED and adds an offsetting debit carrying
        // reversal_of_id; the two corrections must not stack.
        let base = LedgerEntry {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            sequence_number: 1,
            transaction_type: TransactionType::Credit,
            account_type: LedgerAccount::Escrow,
            business_id: Uuid::new_v4(),
            reference_kind: None,
            reference_id: None,
            amount: dec!(100.00),
            amount_minor_units: 10_000,
            currency: "ZAR".to_string(),
            description: None,
            metadata: None,
            posting_state: PostingState::Reversed,
            effective_at: Utc::now(),
            posted_at: Some(Utc::now()),
            reversal_of_id: None,
            reversed_by_id: None,
            created_at: Utc::now(),
        };
        let mut offset = base.clone();
        offset.id = Uuid::new_v4();
        offset.correlation_id = Uuid::new_v4();
        offset.sequence_number = 2;
        offset.transaction_type = TransactionType::Debit;
        offset.posting_state = PostingState::Pending;
        offset.posted_at = None;
        offset.reversal_of_id = Some(base.id);

        let balance: Decimal = [&base, &offset].iter().map(|e| e.signed_amount()).sum();
        assert_eq!(balance, Decimal::ZERO);
    }

    #[test]
    fn test_balance_tolerance_is_one_cent() {
        assert_eq!(BALANCE_TOLERANCE, dec!(0.01));
    }
}
