//! Polling helpers for asserting on work done by background tasks.

use std::future::Future;
use std::time::Duration;

/// How long the helpers poll before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition ended up holding.
pub async fn wait_until_timeout(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within [`DEFAULT_WAIT`].
pub async fn wait_until(what: &str, condition: impl FnMut() -> bool) {
    assert!(
        wait_until_timeout(DEFAULT_WAIT, condition).await,
        "timed out waiting for {what}"
    );
}

/// Polls an async check until it holds.
///
/// Used when the check itself needs the store lock, e.g. counting rows
/// through `SyncEngine::run_exclusive`.
///
/// # Panics
///
/// Panics if the condition does not hold within [`DEFAULT_WAIT`].
pub async fn wait_until_async<F, Fut>(what: &str, condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(
        wait_until_async_timeout(DEFAULT_WAIT, condition).await,
        "timed out waiting for {what}"
    );
}

/// Async counterpart of [`wait_until_timeout`].
pub async fn wait_until_async_timeout<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
