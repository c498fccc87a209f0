use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppResult;
use crate::jobs::JobRepository;

const STUCK_JOB_NOTE: &str = "reset by recovery: stuck in processing";

/// Returns jobs abandoned mid-flight (crashed worker, lost connection)
/// to the pending pool. A job's ledger entries only ever commit in the
/// same transaction as its terminal status, so a row still in processing
/// past the threshold has written nothing and is safe to retry.
pub struct RecoveryEngine {
    jobs: Arc<JobRepository>,
    stuck_threshold_minutes: i64,
}

impl RecoveryEngine {
    pub fn new(jobs: Arc<JobRepository>, stuck_threshold_minutes: i64) -> Self {
        Self {
            jobs,
            stuck_threshold_minutes,
        }
    }

    /// One sweep; returns the ids of jobs reset.
    pub async fn reset_stuck_jobs(&self) -> AppResult<Vec<Uuid>> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.stuck_threshold_minutes);
        let reset = self.jobs.reset_stuck_jobs(cutoff, STUCK_JOB_NOTE).await?;

        if !reset.is_empty() {
            info!(count = reset.len(), "♻️ Reset stuck jobs to pending");
        }
        Ok(reset)
    }

    /// Start the periodic sweep (runs in background)
    pub fn start(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let engine = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = engine.reset_stuck_jobs().await {
                    error!("❌ Stuck-job sweep failed: {:?}", e);
                }
            }
        })
    }
}
