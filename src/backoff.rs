//! Exponential backoff with jitter.

use std::time::Duration;

/// Delay before retry `attempt` (0-based): `base · 2^attempt`, plus up to
/// 255 ms of jitter so synchronized retries fan out. Capped at 5 minutes.
#[must_use]
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(factor).min(Duration::from_secs(300));
    let jitter = Duration::from_millis(u64::from(rand::random::<u8>()));
    delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let base = Duration::from_secs(5);
        let d0 = backoff_delay(base, 0);
        let d2 = backoff_delay(base, 2);
        assert!(d0 >= Duration::from_secs(5) && d0 < Duration::from_secs(6));
        assert!(d2 >= Duration::from_secs(20) && d2 < Duration::from_secs(21));
    }

    #[test]
    fn caps_at_five_minutes() {
        let d = backoff_delay(Duration::from_secs(60), 30);
        assert!(d <= Duration::from_secs(301));
    }
}
