use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Sub-chunk size for `IN`/`ANY` queries over very large id lists
const LOAD_CHUNK: usize = 1_000;

const JOB_COLUMNS: &str = "id, kind, business_id, amount, currency, status, \
     escrow_deposit_id, settlement_window_id, transaction_id, error_message, \
     processed_at, created_at, updated_at";

pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_job(
        &self,
        kind: JobKind,
        business_id: Uuid,
        amount: Decimal,
        currency: &str,
        escrow_deposit_id: Option<Uuid>,
    ) -> AppResult<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO jobs (kind, business_id, amount, currency, escrow_deposit_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {JOB_COLUMNS}"
        ))
        .bind(kind)
        .bind(business_id)
        .bind(amount)
        .bind(currency)
        .bind(escrow_deposit_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Load a batch of jobs, sub-chunked to bound query size for very large
    /// batches.
    pub async fn load_jobs(&self, job_ids: &[Uuid]) -> AppResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(job_ids.len());
        for chunk in job_ids.chunks(LOAD_CHUNK) {
            let mut loaded = sqlx::query_as::<_, Job>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ANY($1)"
            ))
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;
            jobs.append(&mut loaded);
        }
        Ok(jobs)
    }

    /// Claim pending jobs for processing. Only rows still pending move;
    /// returns the ids actually claimed.
    pub async fn mark_processing(&self, job_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let mut claimed = Vec::with_capacity(job_ids.len());
        for chunk in job_ids.chunks(LOAD_CHUNK) {
            let rows: Vec<(Uuid,)> = sqlx::query_as(
                "UPDATE jobs SET status = 'processing', updated_at = NOW() \
                 WHERE id = ANY($1) AND status = 'pending' RETURNING id",
            )
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;
            claimed.extend(rows.into_iter().map(|(id,)| id));
        }
        debug!(requested = job_ids.len(), claimed = claimed.len(), "Claimed jobs");
        Ok(claimed)
    }

    /// Pending job ids in a settlement window for one job kind, oldest
    /// first.
    pub async fn pending_ids_for_window(
        &self,
        window_id: Uuid,
        kind: JobKind,
    ) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM jobs \
             WHERE settlement_window_id = $1 AND kind = $2 AND status = 'pending' \
             ORDER BY created_at",
        )
        .bind(window_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Correlation ids of succeeded jobs in a window, for bulk posting.
    pub async fn succeeded_correlations_for_window(
        &self,
        window_id: Uuid,
    ) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT transaction_id FROM jobs \
             WHERE settlement_window_id = $1 AND status = 'succeeded' \
               AND transaction_id IS NOT NULL",
        )
        .bind(window_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Businesses with at least one succeeded job in the window; feeds the
    /// post-settlement reconciliation enqueue.
    pub async fn succeeded_businesses_for_window(
        &self,
        window_id: Uuid,
    ) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT business_id FROM jobs \
             WHERE settlement_window_id = $1 AND status = 'succeeded'",
        )
        .bind(window_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Assign jobs to a settlement window in one statement per chunk.
    pub async fn assign_to_window(
        &self,
        job_ids: &[Uuid],
        window_id: Uuid,
    ) -> AppResult<u64> {
        let mut assigned = 0;
        for chunk in job_ids.chunks(LOAD_CHUNK) {
            assigned += sqlx::query(
                "UPDATE jobs SET settlement_window_id = $2, updated_at = NOW() \
                 WHERE id = ANY($1) AND settlement_window_id IS NULL",
            )
            .bind(chunk)
            .bind(window_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(assigned)
    }

    // ========== BULK STATUS UPDATES ==========

    /// Mark jobs succeeded in one CASE-based statement: each job gets its
    /// ledger correlation id and a shared processed_at.
    pub async fn bulk_mark_succeeded_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        updates: &[(Uuid, Uuid)],
        processed_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE jobs SET status = 'succeeded', transaction_id = CASE id ",
        );
        for (job_id, correlation_id) in updates {
            qb.push("WHEN ")
                .push_bind(job_id)
                .push(" THEN ")
                .push_bind(correlation_id)
                .push(" ");
        }
        qb.push("END, processed_at = ")
            .push_bind(processed_at)
            .push(", error_message = NULL, updated_at = NOW() WHERE id IN (");
        let mut separated = qb.separated(", ");
        for (job_id, _) in updates {
            separated.push_bind(job_id);
        }
        separated.push_unseparated(") AND status = 'processing'");

        Ok(qb.build().execute(&mut **tx).await?.rows_affected())
    }

    /// Mark jobs failed with per-job error messages, one statement.
    pub async fn bulk_mark_failed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        failures: &[(Uuid, String)],
    ) -> AppResult<u64> {
        if failures.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE jobs SET status = 'failed', error_message = CASE id ",
        );
        for (job_id, error) in failures {
            qb.push("WHEN ")
                .push_bind(job_id)
                .push(" THEN ")
                .push_bind(error.clone())
                .push(" ");
        }
        qb.push("END, updated_at = NOW() WHERE id IN (");
        let mut separated = qb.separated(", ");
        for (job_id, _) in failures {
            separated.push_bind(job_id);
        }
        separated.push_unseparated(") AND status IN ('pending', 'processing')");

        Ok(qb.build().execute(&mut **tx).await?.rows_affected())
    }

    /// Failure marking outside any batch transaction, for recording an error
    /// durably after the main transaction rolled back.
    pub async fn bulk_mark_failed(&self, failures: &[(Uuid, String)]) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let affected = self.bulk_mark_failed_in_tx(&mut tx, failures).await?;
        tx.commit().await?;
        Ok(affected)
    }

    /// Return claimed jobs to pending, e.g. when their business row was held
    /// by a concurrent batch and this run abandoned the group.
    pub async fn reset_to_pending(&self, job_ids: &[Uuid]) -> AppResult<u64> {
        let mut affected = 0;
        for chunk in job_ids.chunks(LOAD_CHUNK) {
            affected += sqlx::query(
                "UPDATE jobs SET status = 'pending', updated_at = NOW() \
                 WHERE id = ANY($1) AND status = 'processing'",
            )
            .bind(chunk)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(affected)
    }

    /// Recovery reset: jobs stuck in processing past the cutoff go back to
    /// pending. Safe because ledger writes only commit alongside a terminal
    /// succeeded status; a stuck job has no entries by construction.
    pub async fn reset_stuck_jobs(
        &self,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE jobs \
             SET status = 'pending', error_message = $2, updated_at = NOW() \
             WHERE status = 'processing' AND updated_at < $1 \
             RETURNING id",
        )
        .bind(cutoff)
        .bind(note)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
