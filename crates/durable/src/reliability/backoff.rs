//! Retry backoff

use std::time::Duration;

/// Backoff base used when none is configured
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Seconds to wait before a failed job becomes eligible again.
///
/// `attempts` is the attempt count after the failure being handled.
/// Defined as `max(1, base^attempts)`; saturates instead of overflowing.
/// No jitter.
///
/// ```
/// use queuectl_durable::backoff;
///
/// assert_eq!(backoff(2, 1), 2);
/// assert_eq!(backoff(2, 3), 8);
/// assert_eq!(backoff(0, 4), 1);
/// ```
pub fn backoff(base: u32, attempts: u32) -> u64 {
    u64::from(base).saturating_pow(attempts).max(1)
}

/// [`backoff`] as a [`Duration`].
pub fn backoff_delay(base: u32, attempts: u32) -> Duration {
    Duration::from_secs(backoff(base, attempts))
}
