//! Retry delay after repeated identical failures.

use std::time::Duration;

/// Identical failures tolerated on the fast schedule.
pub const FAST_RETRIES: u32 = 5;
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Delay before the next retry after `same_error_count` identical failures:
/// one second for the first five, then doubling up to five minutes.
pub fn retry_delay(same_error_count: u32) -> Duration {
    if same_error_count <= FAST_RETRIES {
        return Duration::from_secs(1);
    }
    let exp = same_error_count - FAST_RETRIES;
    // 2^9 already exceeds the cap.
    if exp >= 9 {
        return MAX_DELAY;
    }
    Duration::from_secs(1u64 << exp).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_five_are_one_second() {
        for n in 0..=5 {
            assert_eq!(retry_delay(n), Duration::from_secs(1), "n={}", n);
        }
    }

    #[test]
    fn doubles_then_caps() {
        assert_eq!(retry_delay(6), Duration::from_secs(2));
        assert_eq!(retry_delay(7), Duration::from_secs(4));
        assert_eq!(retry_delay(13), Duration::from_secs(256));
        assert_eq!(retry_delay(14), MAX_DELAY);
        assert_eq!(retry_delay(u32::MAX), MAX_DELAY);
    }

    #[test]
    fn monotonic() {
        let mut prev = Duration::ZERO;
        for n in 0..64 {
            let d = retry_delay(n);
            assert!(d >= prev);
            assert!(d <= MAX_DELAY);
            prev = d;
        }
    }
}
