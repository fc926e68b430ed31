//! Backoff between step retries.
//!
//! `attempt` is the zero-based index of the attempt about to run; the first
//! try (attempt 0) never waits.

use std::time::Duration;

use crate::task::RetryStrategy;

/// Base delay for exponential and linear backoff.
pub const BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Cap for exponential backoff.
pub const MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Fixed delay for the immediate strategy.
pub const IMMEDIATE_DELAY: Duration = Duration::from_millis(100);

/// Delay to wait before running `attempt`.
///
/// - exponential: `min(1000 * 2^(attempt-1), 30000)` ms
/// - linear: `1000 * attempt` ms
/// - immediate: 100 ms
pub fn backoff_delay(strategy: RetryStrategy, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    match strategy {
        RetryStrategy::Exponential => {
            let multiplier = 2u64.saturating_pow(attempt - 1);
            let delay_ms = (BASE_DELAY.as_millis() as u64).saturating_mul(multiplier);
            Duration::from_millis(delay_ms.min(MAX_DELAY.as_millis() as u64))
        }
        RetryStrategy::Linear => {
            Duration::from_millis((BASE_DELAY.as_millis() as u64).saturating_mul(attempt as u64))
        }
        RetryStrategy::Immediate => IMMEDIATE_DELAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let ms = |a| backoff_delay(RetryStrategy::Exponential, a).as_millis();
        assert_eq!(ms(0), 0);
        assert_eq!(ms(1), 1_000);
        assert_eq!(ms(2), 2_000);
        assert_eq!(ms(3), 4_000);
        assert_eq!(ms(5), 16_000);

        // Should be capped
        assert_eq!(ms(6), 30_000);
        assert_eq!(ms(64), 30_000);
    }

    #[test]
    fn test_linear_and_immediate() {
        assert_eq!(backoff_delay(RetryStrategy::Linear, 1).as_millis(), 1_000);
        assert_eq!(backoff_delay(RetryStrategy::Linear, 4).as_millis(), 4_000);
        assert_eq!(backoff_delay(RetryStrategy::Immediate, 1).as_millis(), 100);
        assert_eq!(backoff_delay(RetryStrategy::Immediate, 9).as_millis(), 100);
    }
}
