use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use super::coordinator::SettlementCoordinator;

/// Background driver: periodically settles every window whose end has
/// passed, after first returning windows stranded in 'processing' by a
/// crashed runner. process_window is idempotent, so overlapping ticks and
/// multiple instances are safe.
pub struct SettlementScheduler {
    coordinator: Arc<SettlementCoordinator>,
    tick_secs: u64,
    stuck_threshold_minutes: i64,
}

impl SettlementScheduler {
    pub fn new(
        coordinator: Arc<SettlementCoordinator>,
        tick_secs: u64,
        stuck_threshold_minutes: i64,
    ) -> Self {
        Self {
            coordinator,
            tick_secs,
            stuck_threshold_minutes,
        }
    }

    /// Start the settlement sweep (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let tick_secs = self.tick_secs;
        let stuck_threshold_minutes = self.stuck_threshold_minutes;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(tick_secs));
            loop {
                ticker.tick().await;
                Self::run_sweep(&coordinator, stuck_threshold_minutes).await;
            }
        })
    }

    async fn run_sweep(coordinator: &Arc<SettlementCoordinator>, stuck_threshold_minutes: i64) {
        let cutoff = Utc::now() - ChronoDuration::minutes(stuck_threshold_minutes);
        if let Err(e) = coordinator.recover_stuck_windows(cutoff).await {
            error!("❌ Failed to recover stuck settlement windows: {:?}", e);
        }

        let due = match coordinator.due_window_ids(Utc::now()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("❌ Failed to list due settlement windows: {:?}", e);
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        info!("🔄 Starting settlement sweep: {} due window(s)", due.len());

        for window_id in due {
            match coordinator.process_window(window_id).await {
                Ok(result) if result.already_processed => {}
                Ok(result) => {
                    info!(
                        %window_id,
                        processed = result.processed(),
                        failed = result.failed(),
                        "✓ Window settled"
                    );
                }
                Err(e) => {
                    error!(%window_id, "❌ Window settlement failed: {:?}", e);
                }
            }
        }
    }
}
