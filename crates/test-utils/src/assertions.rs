//! Polling assertions for async tests.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

/// Default polling interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Background tasks (periodic discovery, eager reconnection) finish at
/// non-deterministic times; polling keeps tests free of fixed sleeps.
///
/// Returns `true` if the condition became true before the timeout.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use evdb_test_utils::assert_eventually;
///
/// #[tokio::test]
/// async fn test_background_refresh() {
///     let rounds = Arc::new(AtomicUsize::new(0));
///     let counter = rounds.clone();
///
///     tokio::spawn(async move {
///         for _ in 0..3 {
///             tokio::time::sleep(Duration::from_millis(20)).await;
///             counter.fetch_add(1, Ordering::SeqCst);
///         }
///     });
///
///     let done = assert_eventually(Duration::from_secs(1), || {
///         rounds.load(Ordering::SeqCst) >= 3
///     }).await;
///     assert!(done, "three refresh rounds should run");
/// }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    // Final check after timeout
    condition()
}

/// Like [`assert_eventually`], for conditions that must await.
///
/// Each condition runs to completion; a condition that hangs past the timeout is
/// not interrupted.
pub async fn assert_eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition().await
}
