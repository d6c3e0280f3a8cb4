//! Reconnection delay policy.
//!
//! Two independent delays keep a fleet of clients from hammering the edge:
//!
//! - exponential backoff while one transport retries its first connection
//! - random jitter before a backup transport dials during reconnection

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (zero based).
///
/// Doubles from `initial` and saturates at `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Uniformly random delay in `[0, max)`.
#[must_use]
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}
