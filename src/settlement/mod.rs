pub mod coordinator;
pub mod models;
pub mod scheduler;

pub use coordinator::SettlementCoordinator;
pub use models::*;
pub use scheduler::SettlementScheduler;
