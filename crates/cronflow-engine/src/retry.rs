//! Backoff delay computation between retry attempts.

use std::time::Duration;

use cronflow_types::BackoffStrategy;

/// Delay before retry number `attempt` (1-indexed: the upcoming retry).
///
/// No jitter and no ceiling; arithmetic saturates instead of overflowing.
pub fn delay(strategy: BackoffStrategy, base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let attempt = attempt.max(1);
    let ms = match strategy {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let factor = 2u64.checked_pow(attempt - 1).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_table() {
        let base = Duration::from_millis(1000);
        let cases = [
            (BackoffStrategy::Fixed, 1, 1000),
            (BackoffStrategy::Fixed, 2, 1000),
            (BackoffStrategy::Fixed, 5, 1000),
            (BackoffStrategy::Linear, 1, 1000),
            (BackoffStrategy::Linear, 2, 2000),
            (BackoffStrategy::Linear, 5, 5000),
            (BackoffStrategy::Exponential, 1, 1000),
            (BackoffStrategy::Exponential, 2, 2000),
            (BackoffStrategy::Exponential, 3, 4000),
            (BackoffStrategy::Exponential, 5, 16000),
        ];
        for (strategy, attempt, expected) in cases {
            assert_eq!(
                delay(strategy, base, attempt),
                Duration::from_millis(expected),
                "{strategy:?} attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_exponential_saturates() {
        let d = delay(BackoffStrategy::Exponential, Duration::from_millis(1000), 200);
        assert_eq!(d, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_zero_base() {
        assert_eq!(
            delay(BackoffStrategy::Exponential, Duration::ZERO, 4),
            Duration::ZERO
        );
    }
}
