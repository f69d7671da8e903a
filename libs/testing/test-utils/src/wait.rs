//! Async polling helpers

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between condition checks in `eventually`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `condition` until it returns true or `timeout` elapses.
///
/// Returns the last observed value, so `assert!(eventually(..).await)` reads
/// naturally in tests.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Condition not met in time");
            return false;
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_eventually_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = eventually(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        let result = eventually(Duration::from_millis(30), || async { false }).await;
        assert!(!result);
    }
}
