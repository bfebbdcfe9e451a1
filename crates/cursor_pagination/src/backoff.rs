use std::time::Duration;

use errors::ErrorMetadataAnyhowExt;
use rand::Rng;

use crate::knobs::{
    LIVE_VIEW_INITIAL_BACKOFF,
    LIVE_VIEW_MAX_BACKOFF,
};

/// Delay schedule between attempts to re-establish a live page
/// subscription.
///
/// Each failure doubles the ceiling, starting at `initial` and capped at
/// `max`. The actual delay is drawn uniformly below the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    pub fn for_live_view() -> Self {
        Self::new(*LIVE_VIEW_INITIAL_BACKOFF, *LIVE_VIEW_MAX_BACKOFF)
    }

    /// The subscription delivered a snapshot.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record `error` and pick how long to wait before resubscribing.
    /// Errors the store classifies as deterministic will not go away by
    /// retrying quickly, so they wait out the full ceiling.
    pub fn fail(&mut self, error: &anyhow::Error, rng: &mut impl Rng) -> Duration {
        let ceiling = if error.is_deterministic_user_error() {
            self.max
        } else {
            self.ceiling()
        };
        self.failures = self.failures.saturating_add(1);
        ceiling.mul_f64(rng.random::<f64>())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn ceiling(&self) -> Duration {
        1u32.checked_shl(self.failures)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use errors::ErrorMetadata;
    use rand::{
        rngs::StdRng,
        SeedableRng,
    };

    use super::Backoff;

    fn store_unavailable() -> anyhow::Error {
        ErrorMetadata::overloaded("StoreUnavailable", "The document store is unavailable").into()
    }

    #[test]
    fn test_backoff_doubles_until_capped_and_resets() {
        let mut rng = StdRng::seed_from_u64(7);
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let mut backoff = Backoff::new(initial, max);

        let error = store_unavailable();
        for attempt in 0..40u32 {
            assert!(backoff.ceiling() <= max);
            if attempt < 4 {
                assert_eq!(backoff.ceiling(), initial * 2u32.pow(attempt));
            }
            assert!(backoff.fail(&error, &mut rng) <= max);
        }
        assert_eq!(backoff.failures(), 40);
        assert_eq!(backoff.ceiling(), max);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.fail(&error, &mut rng) <= initial);
    }

    #[test]
    fn test_deterministic_errors_wait_full_ceiling() {
        let mut rng = StdRng::seed_from_u64(11);
        let initial = Duration::from_millis(1);
        let max = Duration::from_secs(60);
        let mut backoff = Backoff::new(initial, max);
        let error: anyhow::Error =
            ErrorMetadata::bad_request("InvalidQuery", "The store rejected the query").into();

        // Drawn below `max` rather than below `initial`, so across a handful
        // of draws at least one lands far above the first-failure ceiling.
        let delays: Vec<_> = (0..8).map(|_| backoff.fail(&error, &mut rng)).collect();
        assert!(delays.iter().all(|delay| *delay <= max));
        assert!(delays.iter().any(|delay| *delay > initial * 4));
    }
}
