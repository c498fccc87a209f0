use std::time::Duration;

use rand::Rng;

/// Exponential backoff for transient storage failures: 100ms * 2^attempt,
/// capped at 2s, with up to 25ms of jitter to de-synchronize retrying
/// workers.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms: u64 = 100u64.saturating_mul(1u64 << attempt.min(6));
    let capped = base_ms.min(2_000);
    let jitter = rand::thread_rng().gen_range(0..25);
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let d0 = backoff_delay(0).as_millis() as u64;
        let d1 = backoff_delay(1).as_millis() as u64;
        let d3 = backoff_delay(3).as_millis() as u64;
        let d10 = backoff_delay(10).as_millis() as u64;

        assert!((100..125).contains(&d0));
        assert!((200..225).contains(&d1));
        assert!((800..825).contains(&d3));
        assert!(d10 <= 2_025);
    }
}
