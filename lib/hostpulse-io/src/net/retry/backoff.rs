use std::time::Duration;

/// An exponential backoff strategy.
///
/// The first retry waits for the minimum backoff, and each subsequent retry waits twice as long as the one before it,
/// up to the maximum backoff.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations.
    ///
    /// If `max_backoff` is less than `min_backoff`, it is raised to `min_backoff`.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    /// Calculates the backoff duration after the given number of consecutive failures.
    ///
    /// Zero and one failures both map to the minimum backoff.
    pub fn get_backoff_duration(&self, error_count: u32) -> Duration {
        let exponent = error_count.saturating_sub(1);
        self.min_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .clamp(self.min_backoff, self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn doubles_from_minimum() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(30));

        let delays = (1..=4).map(|n| backoff.get_backoff_duration(n)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
        assert_eq!(backoff.get_backoff_duration(0), Duration::from_millis(500));
        assert_eq!(backoff.get_backoff_duration(10), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn property_test_monotonic_and_bounded(
            min_backoff in 1u64..=10_000,
            extra in 0u64..1_000_000,
            error_count in 0..u32::MAX,
            error_count_increase in 1..5u32
        ) {
            let backoff = ExponentialBackoff::new(
                Duration::from_millis(min_backoff),
                Duration::from_millis(min_backoff + extra),
            );

            let first = backoff.get_backoff_duration(error_count);
            let second = backoff.get_backoff_duration(error_count.saturating_add(error_count_increase));

            prop_assert!(first <= second);
            prop_assert!(first >= backoff.min_backoff);
            prop_assert!(second <= backoff.max_backoff);
        }
    }
}
