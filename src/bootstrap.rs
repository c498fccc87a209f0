use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::escrow::{BalanceCache, EscrowService};
use crate::events::EventBus;
use crate::idempotency::IdempotencyStore;
use crate::jobs::JobRepository;
use crate::ledger::LedgerRepository;
use crate::payroll::{PayrollIntake, SarsTableCalculator};
use crate::processor::BulkProcessor;
use crate::reconciliation::ReconciliationEngine;
use crate::recovery::RecoveryEngine;
use crate::reversal::ReversalEngine;
use crate::sequence::SequenceGenerator;
use crate::settlement::{SettlementCoordinator, SettlementScheduler};

/// Every long-lived component, wired once at startup.
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub events: EventBus,
    pub ledger: Arc<LedgerRepository>,
    pub escrow: Arc<EscrowService>,
    pub jobs: Arc<JobRepository>,
    pub processor: Arc<BulkProcessor>,
    pub payroll: Arc<PayrollIntake>,
    pub coordinator: Arc<SettlementCoordinator>,
    pub reversal: Arc<ReversalEngine>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub recovery: Arc<RecoveryEngine>,
    pub idempotency: Arc<IdempotencyStore>,
}

pub async fn initialize_app_state(config: Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let events = EventBus::default();

    // Core components
    let sequence = Arc::new(SequenceGenerator::new(pool.clone()));
    let ledger = Arc::new(LedgerRepository::new(
        pool.clone(),
        sequence,
        config.currency_divisors.clone(),
    ));
    info!("✅ Ledger repository initialized");

    let cache = Arc::new(BalanceCache::new(config.balance_cache_ttl_ms));
    let escrow = Arc::new(EscrowService::new(
        pool.clone(),
        ledger.clone(),
        cache,
        events.clone(),
    ));
    info!(
        "✅ Escrow service initialized (balance cache TTL {}ms)",
        config.balance_cache_ttl_ms
    );

    let jobs = Arc::new(JobRepository::new(pool.clone()));
    let processor = Arc::new(BulkProcessor::new(
        jobs.clone(),
        ledger.clone(),
        escrow.clone(),
        events.clone(),
    ));
    info!("✅ Bulk processor initialized");

    let payroll = Arc::new(PayrollIntake::new(
        jobs.clone(),
        Arc::new(SarsTableCalculator),
    ));
    info!("✅ Payroll intake initialized");

    let reconciliation = Arc::new(ReconciliationEngine::new(
        pool.clone(),
        ledger.clone(),
        escrow.clone(),
        config.rounding_threshold,
        config.freeze_threshold,
    ));
    let idempotency = Arc::new(IdempotencyStore::new(pool.clone()));
    let coordinator = Arc::new(SettlementCoordinator::new(
        pool.clone(),
        jobs.clone(),
        ledger.clone(),
        processor.clone(),
        reconciliation.clone(),
        idempotency.clone(),
        events.clone(),
        config.idempotency_ttl_hours,
    ));
    info!("✅ Settlement coordinator initialized");

    let reversal = Arc::new(ReversalEngine::new(
        pool.clone(),
        ledger.clone(),
        escrow.clone(),
        events.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        jobs.clone(),
        config.stuck_job_threshold_minutes,
    ));

    Ok(AppState {
        pool,
        config,
        events,
        ledger,
        escrow,
        jobs,
        processor,
        payroll,
        coordinator,
        reversal,
        reconciliation,
        recovery,
        idempotency,
    })
}

/// Spawn the settlement, recovery, reconciliation, and idempotency-expiry
/// loops. Handles are returned so a caller can abort them in tests.
pub fn start_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let scheduler = SettlementScheduler::new(
        state.coordinator.clone(),
        state.config.settlement_tick_secs,
        state.config.stuck_window_threshold_minutes,
    );
    handles.push(scheduler.start());
    info!(
        "✅ Settlement scheduler started (every {}s)",
        state.config.settlement_tick_secs
    );

    handles.push(state.recovery.start(state.config.recovery_interval_secs));
    info!(
        "✅ Recovery sweep started (every {}s)",
        state.config.recovery_interval_secs
    );

    handles.push(
        state
            .reconciliation
            .start(state.config.reconciliation_interval_secs),
    );
    info!(
        "✅ Reconciliation sweep started (every {}s)",
        state.config.reconciliation_interval_secs
    );

    // Hourly idempotency-key expiry
    let idempotency = state.idempotency.clone();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match idempotency.purge_expired().await {
                Ok(purged) if purged > 0 => {
                    info!("🗑️  Purged {} expired idempotency keys", purged);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to purge idempotency keys: {:?}", e),
            }
        }
    }));
    info!("✅ Idempotency key expiry task started (hourly)");

    handles
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
