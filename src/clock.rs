//! Monotonic clock helpers shared by the actor loops.
//!
//! Deadlines are plain data (`Option<Instant>`) stored next to the thing they
//! guard; dropping the data cancels the timer.

use std::future;

use tokio::time::{Instant, sleep_until};

/// Current monotonic time.
#[inline]
#[must_use]
pub fn now() -> Instant {
    Instant::now()
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

/// Returns the earlier of two optional deadlines.
#[inline]
#[must_use]
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn test_earliest() {
        let t = now();
        let later = t + Duration::from_secs(1);
        assert_eq!(earliest(Some(t), Some(later)), Some(t));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(t), None), Some(t));
        assert_eq!(earliest(None, None), None);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_returns() {
        let deadline = now();
        tokio::time::timeout(Duration::from_secs(1), sleep_until_deadline(Some(deadline)))
            .await
            .expect("past deadline fires immediately");
    }

    #[tokio::test]
    async fn test_no_deadline_never_fires() {
        let mut sleep = tokio_test::task::spawn(sleep_until_deadline(None));
        tokio_test::assert_pending!(sleep.poll());

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio_test::assert_pending!(sleep.poll());
    }
}
