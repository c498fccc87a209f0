use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, SettlementError};
use crate::events::{DomainEvent, EventBus};
use crate::idempotency::{Claim, IdempotencyStore};
use crate::jobs::{Job, JobKind, JobRepository};
use crate::ledger::LedgerRepository;
use crate::processor::BulkProcessor;
use crate::reconciliation::ReconciliationEngine;

const WINDOW_COLUMNS: &str = "id, window_type, window_start, window_end, status, \
     transaction_count, total_amount, created_at, updated_at";

/// Groups jobs into time-boxed windows and drives each window through
/// pending -> processing -> settled exactly once.
pub struct SettlementCoordinator {
    pool: PgPool,
    jobs: Arc<JobRepository>,
    ledger: Arc<LedgerRepository>,
    processor: Arc<BulkProcessor>,
    reconciliation: Arc<ReconciliationEngine>,
    idempotency: Arc<IdempotencyStore>,
    events: EventBus,
    idempotency_ttl_hours: i64,
}

impl SettlementCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        jobs: Arc<JobRepository>,
        ledger: Arc<LedgerRepository>,
        processor: Arc<BulkProcessor>,
        reconciliation: Arc<ReconciliationEngine>,
        idempotency: Arc<IdempotencyStore>,
        events: EventBus,
        idempotency_ttl_hours: i64,
    ) -> Self {
        Self {
            pool,
            jobs,
            ledger,
            processor,
            reconciliation,
            idempotency,
            events,
            idempotency_ttl_hours,
        }
    }

    // ========== WINDOW LIFECYCLE ==========

    /// Atomic find-or-create: the unique constraint on
    /// (window_type, window_start, window_end) guarantees one window per
    /// slot no matter how many callers race.
    pub async fn find_or_create_window(
        &self,
        window_type: WindowType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<SettlementWindow> {
        let window = sqlx::query_as::<_, SettlementWindow>(&format!(
            "INSERT INTO settlement_windows (window_type, window_start, window_end) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (window_type, window_start, window_end) \
             DO UPDATE SET updated_at = NOW() \
             RETURNING {WINDOW_COLUMNS}"
        ))
        .bind(window_type)
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&self.pool)
        .await?;

        Ok(window)
    }

    pub async fn get_window(&self, window_id: Uuid) -> AppResult<SettlementWindow> {
        sqlx::query_as::<_, SettlementWindow>(&format!(
            "SELECT {WINDOW_COLUMNS} FROM settlement_windows WHERE id = $1"
        ))
        .bind(window_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::WindowNotFound(window_id).into())
    }

    /// Assign jobs to the window containing their creation instant,
    /// creating the window lazily. Returns the window used.
    pub async fn assign_jobs(
        &self,
        window_type: WindowType,
        jobs: &[Job],
    ) -> AppResult<SettlementWindow> {
        let (start, end) = window_bounds(window_type, Utc::now()).ok_or_else(|| {
            crate::error::AppError::InvalidInput(
                "custom windows need explicit bounds; use find_or_create_window".into(),
            )
        })?;
        let window = self.find_or_create_window(window_type, start, end).await?;

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let assigned = self.jobs.assign_to_window(&ids, window.id).await?;
        let total: Decimal = jobs.iter().map(|j| j.amount).sum();

        sqlx::query(
            "UPDATE settlement_windows \
             SET transaction_count = transaction_count + $2, \
                 total_amount = total_amount + $3, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(window.id)
        .bind(assigned as i32)
        .bind(total)
        .execute(&self.pool)
        .await?;

        info!(window_id = %window.id, assigned, %total, "Jobs assigned to window");
        Ok(window)
    }

    /// Windows whose end has passed and are still pending; the scheduler
    /// feeds these to process_window.
    pub async fn due_window_ids(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM settlement_windows \
             WHERE status = 'pending' AND window_end <= $1 \
             ORDER BY window_end",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Windows abandoned mid-settlement by a crashed runner: anything still
    /// 'processing' past the cutoff goes back to 'pending', and its
    /// in-flight idempotency claim is dropped so the next sweep can re-run
    /// it. Re-running is safe: a window is only marked settled in the same
    /// pass that commits its job and ledger writes.
    pub async fn recover_stuck_windows(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE settlement_windows \
             SET status = 'pending', updated_at = NOW() \
             WHERE status = 'processing' AND updated_at < $1 \
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.into_iter().map(|(id,)| id).collect();
        for window_id in &ids {
            self.idempotency.release(&window_key(*window_id)).await?;
        }
        if !ids.is_empty() {
            warn!(count = ids.len(), "♻️ Reset stuck settlement windows to pending");
        }
        Ok(ids)
    }

    // ========== PROCESSING ==========

    /// Process one window end to end. Safe to call repeatedly and from
    /// concurrent triggers: the idempotency key replays the first result
    /// and the guarded status transition admits exactly one runner.
    pub async fn process_window(&self, window_id: Uuid) -> AppResult<WindowResult> {
        let key = window_key(window_id);

        match self
            .idempotency
            .try_claim(&key, self.idempotency_ttl_hours)
            .await?
        {
            Claim::Completed(stored) => {
                info!(%window_id, "Window already settled; replaying stored result");
                let mut result: WindowResult =
                    serde_json::from_value(stored).unwrap_or_default();
                result.window_id = window_id;
                result.already_processed = true;
                return Ok(result);
            }
            Claim::InFlight => {
                info!(%window_id, "Window is being settled by a concurrent caller");
                return Ok(WindowResult {
                    window_id,
                    already_processed: true,
                    ..Default::default()
                });
            }
            Claim::Acquired => {}
        }

        // Guarded transition: only one caller moves pending -> processing
        let advanced = sqlx::query(
            "UPDATE settlement_windows \
             SET status = 'processing', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(window_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if advanced == 0 {
            let window = self.get_window(window_id).await?;
            self.idempotency.release(&key).await?;
            return match window.status {
                // Settled before our (fresh) claim: replay-equivalent
                WindowStatus::Settled => Ok(WindowResult {
                    window_id,
                    already_processed: true,
                    ..Default::default()
                }),
                status => Err(SettlementError::InvalidWindowState {
                    id: window_id,
                    current: format!("{:?}", status),
                    expected: "Pending".to_string(),
                }
                .into()),
            };
        }

        match self.run_window(window_id).await {
            Ok(result) => {
                let stored = serde_json::to_value(&result)
                    .unwrap_or(serde_json::Value::Null);
                self.idempotency.complete(&key, &stored).await?;
                Ok(result)
            }
            Err(e) => {
                error!(%window_id, error = %e, "Window settlement failed");
                let marked = sqlx::query(
                    "UPDATE settlement_windows \
                     SET status = 'failed', updated_at = NOW() \
                     WHERE id = $1 AND status = 'processing'",
                )
                .bind(window_id)
                .execute(&self.pool)
                .await;
                if let Err(mark_err) = marked {
                    error!(%window_id, error = %mark_err, "Failed to mark window failed");
                }
                self.idempotency.release(&key).await?;
                Err(e)
            }
        }
    }

    async fn run_window(&self, window_id: Uuid) -> AppResult<WindowResult> {
        // Payroll settles first, then payment
        let payroll_ids = self
            .jobs
            .pending_ids_for_window(window_id, JobKind::Payroll)
            .await?;
        let payroll = self.processor.process_batch(&payroll_ids).await?;

        let payment_ids = self
            .jobs
            .pending_ids_for_window(window_id, JobKind::Payment)
            .await?;
        let payment = self.processor.process_batch(&payment_ids).await?;

        // Move the winners' ledger entries from PENDING to POSTED
        let correlations = self
            .jobs
            .succeeded_correlations_for_window(window_id)
            .await?;
        let post = self
            .ledger
            .post_bulk_transactions(&correlations, 3)
            .await?;
        for correlation_id in &post.posted {
            self.events.emit(DomainEvent::TransactionPosted {
                correlation_id: *correlation_id,
            });
        }
        if !post.failed.is_empty() {
            warn!(
                %window_id,
                failed = post.failed.len(),
                "Some correlations failed to post"
            );
        }

        sqlx::query(
            "UPDATE settlement_windows \
             SET status = 'settled', updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(window_id)
        .execute(&self.pool)
        .await?;

        let result = WindowResult {
            window_id,
            already_processed: false,
            payroll,
            payment,
            posted: post.posted.len(),
            post_failed: post.failed.len(),
        };

        self.events.emit(DomainEvent::WindowSettled {
            window_id,
            processed: result.processed(),
            failed: result.failed(),
        });

        // Reconciliation runs after this call's writes are durable,
        // fire-and-forget per business
        let businesses = self
            .jobs
            .succeeded_businesses_for_window(window_id)
            .await?;
        let reconciliation = self.reconciliation.clone();
        tokio::spawn(async move {
            for business_id in businesses {
                if let Err(e) = reconciliation.reconcile_business(business_id).await {
                    error!(%business_id, error = %e, "Post-settlement reconciliation failed");
                }
            }
        });

        info!(
            %window_id,
            processed = result.processed(),
            failed = result.failed(),
            posted = result.posted,
            "Window settled"
        );
        Ok(result)
    }
}

fn window_key(window_id: Uuid) -> String {
    format!("settle-window:{}", window_id)
}
