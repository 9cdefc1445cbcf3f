//! Cooperative mutual exclusion around the local database.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// An async mutex granting ownership to waiters in FIFO order.
///
/// Every access to the storage adapter goes through one `StoreMutex`, so a
/// flush transaction holds it from `BEGIN` to `COMMIT`/`ROLLBACK`. Ownership
/// is released when the guard is dropped, on every exit path. There is no
/// timeout and no re-entrancy: acquiring twice from the same task deadlocks.
#[derive(Debug)]
pub struct StoreMutex<T> {
    inner: Mutex<T>,
    waiters: AtomicUsize,
}

impl<T> StoreMutex<T> {
    /// Creates an unlocked mutex.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Waits until exclusive ownership is granted.
    pub async fn acquire(&self) -> MutexGuard<'_, T> {
        let _waiting = WaitCount::enter(&self.waiters);
        self.inner.lock().await
    }

    /// Acquires ownership only if nobody holds or waits for it.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    /// Runs `f` while holding the mutex.
    pub async fn run_exclusive<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire().await;
        f(&mut *guard)
    }

    /// Returns true if the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Number of tasks currently waiting in [`StoreMutex::acquire`].
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

// Decrements on drop so an abandoned `acquire` future is not counted.
struct WaitCount<'a>(&'a AtomicUsize);

impl<'a> WaitCount<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
