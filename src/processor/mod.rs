use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::escrow::{EscrowService, ReservationRequest};
use crate::events::{DomainEvent, EventBus};
use crate::jobs::{Job, JobKind, JobRepository};
use crate::ledger::{
    EntryReference, LedgerAccount, LedgerRepository, NewTransaction, ReferenceKind,
};
use crate::retry::backoff_delay;

/// Attempts per business transaction before its jobs are marked failed
const MAX_TX_RETRIES: u32 = 3;

/// Aggregate outcome of one batch run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchResult {
    pub processed: usize,
    pub failed: usize,
    pub stats: HashMap<Uuid, BusinessStats>,
}

/// Per-business breakdown within a batch
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusinessStats {
    pub processed: usize,
    pub failed: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub settled_amount: Decimal,
    /// Business row was held by a concurrent batch; its jobs went back to
    /// pending for the next run
    pub skipped_busy: bool,
}

enum BusinessOutcome {
    Completed {
        succeeded: Vec<(Uuid, Uuid)>,
        failed: Vec<(Uuid, String)>,
        settled_amount: Decimal,
    },
    Busy,
}

/// The orchestration core: processes a batch of jobs grouped by business,
/// locking each business exactly once.
///
/// Lock ordering is business -> job -> deposit on every path. True
/// parallelism comes from running multiple invocations over disjoint
/// batches; within one invocation businesses are processed sequentially.
pub struct BulkProcessor {
    jobs: Arc<JobRepository>,
    ledger: Arc<LedgerRepository>,
    escrow: Arc<EscrowService>,
    events: EventBus,
}

impl BulkProcessor {
    pub fn new(
        jobs: Arc<JobRepository>,
        ledger: Arc<LedgerRepository>,
        escrow: Arc<EscrowService>,
        events: EventBus,
    ) -> Self {
        Self {
            jobs,
            ledger,
            escrow,
            events,
        }
    }

    /// Process a batch of job ids. Every claimed job ends the run either
    /// succeeded, failed with an inspectable reason, or back in pending for
    /// the next run; nothing is silently dropped.
    pub async fn process_batch(&self, job_ids: &[Uuid]) -> AppResult<BatchResult> {
        let claimed = self.jobs.mark_processing(job_ids).await?;
        if claimed.is_empty() {
            debug!("No pending jobs claimed from batch of {}", job_ids.len());
            return Ok(BatchResult::default());
        }

        let jobs = self.jobs.load_jobs(&claimed).await?;
        let groups = group_by_business(jobs);
        let business_ids: Vec<Uuid> = groups.keys().copied().collect();

        // Cache-first hint prefetch; the locked row decides later
        let hints = self.escrow.available_balances_bulk(&business_ids).await?;

        let mut result = BatchResult::default();
        for (business_id, group) in groups {
            let hint = hints.get(&business_id).copied();
            let stats = self
                .process_business(business_id, &group, hint)
                .await;
            result.processed += stats.processed;
            result.failed += stats.failed;
            result.stats.insert(business_id, stats);
        }

        info!(
            processed = result.processed,
            failed = result.failed,
            businesses = result.stats.len(),
            "Batch complete"
        );
        Ok(result)
    }

    async fn process_business(
        &self,
        business_id: Uuid,
        group: &[Job],
        balance_hint: Option<Decimal>,
    ) -> BusinessStats {
        // CPU-only work before any lock: totals and ledger payloads
        let total: Decimal = group.iter().map(|j| j.amount).sum();
        let payloads = build_payloads(group);

        let mut attempt = 0u32;
        let outcome = loop {
            match self
                .process_business_once(business_id, group, total, &payloads, balance_hint)
                .await
            {
                Ok(outcome) => break Ok(outcome),
                Err(e) if e.is_transient() && attempt + 1 < MAX_TX_RETRIES => {
                    attempt += 1;
                    warn!(
                        %business_id,
                        attempt,
                        error = %e,
                        "Transient failure in business transaction, retrying"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(BusinessOutcome::Completed {
                succeeded,
                failed,
                settled_amount,
            }) => {
                for (job_id, correlation_id) in &succeeded {
                    let amount = group
                        .iter()
                        .find(|j| j.id == *job_id)
                        .map(|j| j.amount)
                        .unwrap_or(Decimal::ZERO);
                    self.events.emit(DomainEvent::JobSucceeded {
                        job_id: *job_id,
                        business_id,
                        amount,
                        correlation_id: *correlation_id,
                    });
                }
                for (job_id, reason) in &failed {
                    self.events.emit(DomainEvent::JobFailed {
                        job_id: *job_id,
                        business_id,
                        reason: reason.clone(),
                    });
                }
                self.escrow.cache().invalidate(business_id).await;

                BusinessStats {
                    processed: succeeded.len(),
                    failed: failed.len(),
                    settled_amount,
                    skipped_busy: false,
                }
            }
            Ok(BusinessOutcome::Busy) => {
                // Jobs return to pending; the next run picks them up
                let ids: Vec<Uuid> = group.iter().map(|j| j.id).collect();
                if let Err(e) = self.jobs.reset_to_pending(&ids).await {
                    error!(%business_id, error = %e, "Failed to release busy business's jobs");
                }
                BusinessStats {
                    skipped_busy: true,
                    ..Default::default()
                }
            }
            Err(e) => {
                // The main transaction rolled back; record the error durably
                // in a separate lightweight transaction so nothing is lost
                error!(%business_id, error = %e, "Business transaction failed");
                let failures: Vec<(Uuid, String)> = group
                    .iter()
                    .map(|j| (j.id, format!("batch processing error: {}", e)))
                    .collect();
                if let Err(mark_err) = self.jobs.bulk_mark_failed(&failures).await {
                    error!(%business_id, error = %mark_err, "Failed to record job failures");
                }
                for (job_id, reason) in &failures {
                    self.events.emit(DomainEvent::JobFailed {
                        job_id: *job_id,
                        business_id,
                        reason: reason.clone(),
                    });
                }
                BusinessStats {
                    failed: group.len(),
                    ..Default::default()
                }
            }
        }
    }

    /// One attempt at a business's sub-batch, entirely inside one database
    /// transaction. Job success and ledger writes commit together or not at
    /// all; that is the invariant crash recovery relies on.
    async fn process_business_once(
        &self,
        business_id: Uuid,
        group: &[Job],
        total: Decimal,
        payloads: &[NewTransaction],
        balance_hint: Option<Decimal>,
    ) -> AppResult<BusinessOutcome> {
        let mut tx = self.ledger.begin_tx().await?;

        let account = match self.escrow.try_lock_business(&mut tx, business_id).await? {
            Some(account) => account,
            None => return Ok(BusinessOutcome::Busy),
        };

        if account.is_frozen {
            let failed = fail_all(group, "account frozen pending reconciliation");
            self.jobs.bulk_mark_failed_in_tx(&mut tx, &failed).await?;
            tx.commit().await?;
            return Ok(BusinessOutcome::Completed {
                succeeded: Vec::new(),
                failed,
                settled_amount: Decimal::ZERO,
            });
        }

        // The freshly locked row is the balance authority; the prefetched
        // value is only a hint. Log drift, never widen the gate with it.
        let available = account.available();
        if let Some(hint) = balance_hint {
            if hint != available {
                debug!(
                    %business_id,
                    %hint,
                    %available,
                    "Cached balance hint diverged from locked row"
                );
            }
        }

        if total > available {
            let failed = fail_all(
                group,
                &format!(
                    "insufficient balance: required {}, available {}",
                    total, available
                ),
            );
            self.jobs.bulk_mark_failed_in_tx(&mut tx, &failed).await?;
            tx.commit().await?;
            return Ok(BusinessOutcome::Completed {
                succeeded: Vec::new(),
                failed,
                settled_amount: Decimal::ZERO,
            });
        }

        let requests: Vec<ReservationRequest> = group
            .iter()
            .map(|j| ReservationRequest {
                job_id: j.id,
                amount: j.amount,
            })
            .collect();
        let reservations = self.escrow.reserve_in_tx(&mut tx, &account, &requests).await?;

        let mut succeeded: Vec<(Uuid, Uuid)> = Vec::new();
        let mut failed: Vec<(Uuid, String)> = Vec::new();
        let mut reserved_job_ids: Vec<Uuid> = Vec::new();
        for r in &reservations {
            if r.success {
                reserved_job_ids.push(r.job_id);
            } else {
                failed.push((
                    r.job_id,
                    r.error.clone().unwrap_or_else(|| "insufficient balance".into()),
                ));
            }
        }

        let mut settled_amount = Decimal::ZERO;
        if !reserved_job_ids.is_empty() {
            let reserved_payloads: Vec<NewTransaction> = payloads
                .iter()
                .filter(|p| {
                    p.reference
                        .map(|r| reserved_job_ids.contains(&r.id))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            match self
                .ledger
                .record_bulk_in_tx(&mut tx, &reserved_payloads)
                .await
            {
                Ok(pairs) => {
                    for (payload, pair) in reserved_payloads.iter().zip(&pairs) {
                        // reference is always present on processor payloads
                        if let Some(reference) = payload.reference {
                            succeeded.push((reference.id, pair.correlation_id()));
                            settled_amount += payload.amount;
                        }
                    }
                }
                Err(e) => {
                    // Ledger failure must never leave a job marked succeeded
                    // without its entries: roll everything back (including
                    // the hold) and record the failures separately.
                    drop(tx);
                    warn!(%business_id, error = %e, "Ledger recording failed, demoting jobs");
                    let demoted: Vec<(Uuid, String)> = group
                        .iter()
                        .map(|j| (j.id, format!("ledger recording failed: {}", e)))
                        .collect();
                    self.jobs.bulk_mark_failed(&demoted).await?;
                    return Ok(BusinessOutcome::Completed {
                        succeeded: Vec::new(),
                        failed: demoted,
                        settled_amount: Decimal::ZERO,
                    });
                }
            }

            self.escrow
                .apply_settlement_in_tx(&mut tx, business_id, settled_amount)
                .await?;
        }

        let now = Utc::now();
        self.jobs
            .bulk_mark_succeeded_in_tx(&mut tx, &succeeded, now)
            .await?;
        self.jobs.bulk_mark_failed_in_tx(&mut tx, &failed).await?;

        tx.commit().await?;

        debug!(
            %business_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            %settled_amount,
            "Business sub-batch committed"
        );
        Ok(BusinessOutcome::Completed {
            succeeded,
            failed,
            settled_amount,
        })
    }
}

/// Group a batch by business. Each business is locked exactly once per
/// batch, never once per job.
pub fn group_by_business(jobs: Vec<Job>) -> HashMap<Uuid, Vec<Job>> {
    let mut groups: HashMap<Uuid, Vec<Job>> = HashMap::new();
    for job in jobs {
        groups.entry(job.business_id).or_default().push(job);
    }
    groups
}

/// Build the double-entry payload for every job in a group. CPU-only;
/// runs before the business lock is taken.
pub fn build_payloads(group: &[Job]) -> Vec<NewTransaction> {
    group
        .iter()
        .map(|job| {
            let (credit_offset, reference_kind) = match job.kind {
                JobKind::Payroll => (LedgerAccount::Payroll, ReferenceKind::PayrollJob),
                JobKind::Payment => (LedgerAccount::Payment, ReferenceKind::PaymentJob),
            };
            NewTransaction {
                correlation_id: Uuid::new_v4(),
                // Payout leaves escrow: debit the payout account, credit escrow
                debit_account: credit_offset,
                credit_account: LedgerAccount::Escrow,
                business_id: job.business_id,
                amount: job.amount,
                currency: job.currency.clone(),
                description: Some(format!("{} payout", job.kind)),
                reference: Some(EntryReference {
                    kind: reference_kind,
                    id: job.id,
                }),
                metadata: None,
                actor: None,
            }
        })
        .collect()
}

fn fail_all(group: &[Job], reason: &str) -> Vec<(Uuid, String)> {
    group.iter().map(|j| (j.id, reason.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn job(business_id: Uuid, kind: JobKind, amount: Decimal) -> Job {
        Job {
            id: Uuid::new_v4(),
            kind,
            business_id,
            amount,
            currency: "ZAR".to_string(),
            status: JobStatus::Processing,
            escrow_deposit_id: None,
            settlement_window_id: None,
            transaction_id: None,
            error_message: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_group_by_business() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let jobs = vec![
            job(a, JobKind::Payroll, dec!(100)),
            job(b, JobKind::Payment, dec!(200)),
            job(a, JobKind::Payroll, dec!(300)),
        ];

        let groups = group_by_business(jobs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&a].len(), 2);
        assert_eq!(groups[&b].len(), 1);

        let total: usize = groups.values().map(|g| g.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_build_payloads_directions() {
        let business_id = Uuid::new_v4();
        let payroll = job(business_id, JobKind::Payroll, dec!(1_000.00));
        let payment = job(business_id, JobKind::Payment, dec!(2_000.00));
        let payloads = build_payloads(&[payroll.clone(), payment.clone()]);

        assert_eq!(payloads.len(), 2);

        // Payouts credit escrow so the escrow balance falls
        assert_eq!(payloads[0].credit_account, LedgerAccount::Escrow);
        assert_eq!(payloads[0].debit_account, LedgerAccount::Payroll);
        assert_eq!(payloads[0].reference.unwrap().kind, ReferenceKind::PayrollJob);
        assert_eq!(payloads[0].reference.unwrap().id, payroll.id);

        assert_eq!(payloads[1].debit_account, LedgerAccount::Payment);
        assert_eq!(payloads[1].reference.unwrap().kind, ReferenceKind::PaymentJob);

        // Distinct correlations per job
        assert_ne!(payloads[0].correlation_id, payloads[1].correlation_id);
    }

    #[test]
    fn test_group_totals_drive_balance_gate() {
        let business_id = Uuid::new_v4();
        let group = vec![
            job(business_id, JobKind::Payroll, dec!(1_000.00)),
            job(business_id, JobKind::Payroll, dec!(2_000.00)),
            job(business_id, JobKind::Payroll, dec!(8_000.00)),
        ];
        let total: Decimal = group.iter().map(|j| j.amount).sum();
        // The whole group is gated on the aggregate, not per job
        assert_eq!(total, dec!(11_000.00));
        assert!(total > dec!(10_000.00));
    }
}
