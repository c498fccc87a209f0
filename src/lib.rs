pub mod bootstrap;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod idempotency;
pub mod jobs;
pub mod ledger;
pub mod payroll;
pub mod processor;
pub mod reconciliation;
pub mod recovery;
pub mod retry;
pub mod reversal;
pub mod sequence;
pub mod settlement;
