//! Stall backoff schedule.
//!
//! The exact delays are user-visible ("Retrying in Ns"), so the schedule is
//! fixed rather than jittered.

use std::time::Duration;

/// Delays between consecutive stall retries, capped at the last entry.
const SCHEDULE_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

/// Stalls tolerated before the download fails with TIMEOUT.
pub const MAX_CONSECUTIVE_STALLS: u32 = 6;

/// Delay before retry number `stall_count` (1-indexed).
#[must_use]
pub fn stall_backoff(stall_count: u32) -> Duration {
    let idx = (stall_count.max(1) as usize - 1).min(SCHEDULE_SECS.len() - 1);
    Duration::from_secs(SCHEDULE_SECS[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_doubles_then_caps() {
        assert_eq!(stall_backoff(1), Duration::from_secs(1));
        assert_eq!(stall_backoff(2), Duration::from_secs(2));
        assert_eq!(stall_backoff(3), Duration::from_secs(4));
        assert_eq!(stall_backoff(4), Duration::from_secs(8));
        assert_eq!(stall_backoff(5), Duration::from_secs(16));
        assert_eq!(stall_backoff(6), Duration::from_secs(30));
        assert_eq!(stall_backoff(7), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_is_treated_as_first() {
        assert_eq!(stall_backoff(0), Duration::from_secs(1));
    }
}
