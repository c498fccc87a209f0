use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Business account holding escrowed funds.
///
/// `escrow_balance` is a performance cache of the ledger-derived balance;
/// the ledger is authoritative. `hold_amount` is reserved-but-not-settled.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BusinessAccount {
    pub id: Uuid,
    pub name: String,

    #[serde(with = "rust_decimal::serde::float")]
    pub escrow_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub hold_amount: Decimal,
    pub is_frozen: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BusinessAccount {
    pub fn available(&self) -> Decimal {
        self.escrow_balance - self.hold_amount
    }

    pub fn has_available(&self, required: Decimal) -> bool {
        self.available() >= required
    }
}

/// Funding record for money that entered escrow
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowDeposit {
    pub id: Uuid,
    pub business_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One job's reservation request against a business's available balance
#[derive(Debug, Clone, Copy)]
pub struct ReservationRequest {
    pub job_id: Uuid,
    pub amount: Decimal,
}

/// Per-job outcome of a bulk reservation
#[derive(Debug, Clone, Serialize)]
pub struct ReservationResult {
    pub job_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_available_balance() {
        let account = BusinessAccount {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            escrow_balance: dec!(10_000.00),
            hold_amount: dec!(2_500.00),
            is_frozen: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(account.available(), dec!(7_500.00));
        assert!(account.has_available(dec!(7_500.00)));
        assert!(!account.has_available(dec!(7_500.01)));
    }
}
