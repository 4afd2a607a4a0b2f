//! Shared test utilities for evdb crates.
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`assert_eventually_async`] - Same, for conditions that await

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod assertions;
pub use assertions::{assert_eventually, assert_eventually_async};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_assert_eventually_immediate_success() {
        assert!(assert_eventually(Duration::from_millis(100), || true).await);
    }

    #[tokio::test]
    async fn test_assert_eventually_counts_checks() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(result);
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_assert_eventually_timeout() {
        assert!(!assert_eventually(Duration::from_millis(50), || false).await);
    }

    #[tokio::test]
    async fn test_assert_eventually_async_sees_spawned_change() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.store(true, Ordering::SeqCst);
        });

        let result = assert_eventually_async(Duration::from_millis(500), || {
            let flag = flag.clone();
            async move {
                tokio::task::yield_now().await;
                flag.load(Ordering::SeqCst)
            }
        })
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_assert_eventually_async_timeout() {
        let result = assert_eventually_async(Duration::from_millis(40), || async { false }).await;
        assert!(!result);
    }
}
