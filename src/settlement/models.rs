use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::processor::BatchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "window_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    Hourly,
    Daily,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "window_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WindowStatus {
    Pending,
    Processing,
    Settled,
    Failed,
}

impl WindowStatus {
    /// pending -> processing -> settled; failed absorbs from pending or
    /// processing. Settled and failed are terminal. processing -> pending
    /// is the crash-recovery reset for windows stranded by a dead runner.
    pub fn can_transition_to(&self, to: WindowStatus) -> bool {
        matches!(
            (self, to),
            (WindowStatus::Pending, WindowStatus::Processing)
                | (WindowStatus::Pending, WindowStatus::Failed)
                | (WindowStatus::Processing, WindowStatus::Settled)
                | (WindowStatus::Processing, WindowStatus::Failed)
                | (WindowStatus::Processing, WindowStatus::Pending)
        )
    }
}

/// Time-boxed batch container. Exactly one window exists per
/// (window_type, window_start, window_end); the unique constraint plus
/// upsert find-or-create enforce it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettlementWindow {
    pub id: Uuid,
    pub window_type: WindowType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: WindowStatus,
    pub transaction_count: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bounds of the window containing `at`. Custom windows are caller-defined
/// and have no canonical bounds.
pub fn window_bounds(
    window_type: WindowType,
    at: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match window_type {
        WindowType::Hourly => {
            let start = at
                .with_minute(0)?
                .with_second(0)?
                .with_nanosecond(0)?;
            Some((start, start + Duration::hours(1)))
        }
        WindowType::Daily => {
            let start = at
                .with_hour(0)?
                .with_minute(0)?
                .with_second(0)?
                .with_nanosecond(0)?;
            Some((start, start + Duration::days(1)))
        }
        WindowType::Custom => None,
    }
}

/// Result of processing one settlement window
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WindowResult {
    pub window_id: Uuid,
    pub already_processed: bool,
    pub payroll: BatchResult,
    pub payment: BatchResult,
    pub posted: usize,
    pub post_failed: usize,
}

impl WindowResult {
    pub fn processed(&self) -> usize {
        self.payroll.processed + self.payment.processed
    }

    pub fn failed(&self) -> usize {
        self.payroll.failed + self.payment.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_status_machine() {
        assert!(WindowStatus::Pending.can_transition_to(WindowStatus::Processing));
        assert!(WindowStatus::Pending.can_transition_to(WindowStatus::Failed));
        assert!(WindowStatus::Processing.can_transition_to(WindowStatus::Settled));
        assert!(WindowStatus::Processing.can_transition_to(WindowStatus::Failed));

        assert!(!WindowStatus::Settled.can_transition_to(WindowStatus::Processing));
        assert!(!WindowStatus::Failed.can_transition_to(WindowStatus::Pending));
        assert!(!WindowStatus::Pending.can_transition_to(WindowStatus::Settled));
    }

    #[test]
    fn test_stranded_window_can_return_to_pending() {
        // Crash recovery: a window left in processing goes back to pending
        // so the scheduler can pick it up again; terminal states never do
        assert!(WindowStatus::Processing.can_transition_to(WindowStatus::Pending));
        assert!(!WindowStatus::Settled.can_transition_to(WindowStatus::Pending));
    }

    #[test]
    fn test_hourly_window_bounds() {
        let at = Utc.with_ymd_and_hms(2026, 8, 27, 14, 35, 12).unwrap();
        let (start, end) = window_bounds(WindowType::Hourly, at).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 27, 14, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 8, 27, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_window_bounds() {
        let at = Utc.with_ymd_and_hms(2026, 8, 27, 14, 35, 12).unwrap();
        let (start, end) = window_bounds(WindowType::Daily, at).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 27, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 8, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_custom_window_has_no_canonical_bounds() {
        assert!(window_bounds(WindowType::Custom, Utc::now()).is_none());
    }

    #[test]
    fn test_boundary_instant_falls_in_new_window() {
        let at = Utc.with_ymd_and_hms(2026, 8, 27, 15, 0, 0).unwrap();
        let (start, _) = window_bounds(WindowType::Hourly, at).unwrap();
        assert_eq!(start, at);
    }
}
