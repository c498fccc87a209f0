use thiserror::Error;

use crate::ledger::models::LedgerAccount;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0} (must be > 0)")]
    InvalidAmount(String),

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Debit and credit accounts must differ: {0:?}")]
    SameAccount(LedgerAccount),

    #[error("No paired entry found for correlation {0}")]
    PairNotFound(uuid::Uuid),

    #[error("Currency mismatch within correlation {correlation_id}: {left} vs {right}")]
    CurrencyMismatch {
        correlation_id: uuid::Uuid,
        left: String,
        right: String,
    },

    #[error("Unbalanced transaction {correlation_id}: debits {debits}, credits {credits}")]
    UnbalancedTransaction {
        correlation_id: uuid::Uuid,
        debits: String,
        credits: String,
    },

    #[error("Correlation {0} already reversed")]
    AlreadyReversed(uuid::Uuid),

    #[error("Invalid posting state transition: {current} -> {attempted}")]
    InvalidStateTransition { current: String, attempted: String },
}

/// Escrow / funds reservation errors
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Business {0} is busy (row locked by a concurrent batch)")]
    BusinessBusy(uuid::Uuid),

    #[error("Business {0} is frozen pending reconciliation")]
    AccountFrozen(uuid::Uuid),

    #[error("Business not found: {0}")]
    BusinessNotFound(uuid::Uuid),
}

/// Settlement window errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Window not found: {0}")]
    WindowNotFound(uuid::Uuid),

    #[error("Window {id} in invalid state: {current}, expected: {expected}")]
    InvalidWindowState {
        id: uuid::Uuid,
        current: String,
        expected: String,
    },

    #[error("Window {0} already processed")]
    AlreadyProcessed(uuid::Uuid),
}

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Discrepancy on business {business_id}: stored {stored}, ledger {ledger}")]
    DiscrepancyDetected {
        business_id: uuid::Uuid,
        stored: String,
        ledger: String,
    },
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Transient storage failures worth retrying at the transaction boundary:
    /// serialization failure (40001), deadlock detected (40P01), lock not
    /// available (55P03). Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("55P03")
            ),
            AppError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}
