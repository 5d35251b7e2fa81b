//! Counting semaphore with FIFO waiters.
//!
//! Thin wrapper over [`tokio::sync::Semaphore`], which is fair: permits are
//! granted to waiters in the order `acquire` was called, and a released
//! permit goes straight to the head of the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::OwnedSemaphorePermit;

/// Bounded permit pool with a fixed capacity.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    capacity: usize,
    waiting: Arc<AtomicUsize>,
}

/// A held permit. Dropping it (or calling [`Permit::release`]) returns it.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    /// Return the permit, waking the oldest waiter if any.
    pub fn release(self) {}
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` permits.
    ///
    /// # Panics
    /// Panics if `permits` is zero or exceeds [`tokio::sync::Semaphore::MAX_PERMITS`].
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "semaphore capacity must be positive");
        assert!(
            permits <= tokio::sync::Semaphore::MAX_PERMITS,
            "semaphore capacity too large"
        );
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(permits)),
            capacity: permits,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit. Callers are served in FIFO order.
    pub async fn acquire(&self) -> Permit {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(&self.waiting);
        match self.inner.clone().acquire_owned().await {
            Ok(permit) => Permit { _permit: permit },
            // The inner semaphore is owned here and never closed.
            Err(_) => unreachable!("semaphore closed"),
        }
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Fixed total number of permits.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Permits currently held.
    #[inline]
    pub fn held(&self) -> usize {
        self.capacity - self.available()
    }

    /// Callers currently blocked in [`Semaphore::acquire`].
    #[inline]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_counts() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.available(), 2);

        let a = sem.acquire().await;
        let b = sem.acquire().await;
        assert_eq!(sem.available(), 0);
        assert_eq!(sem.held(), 2);
        assert!(sem.try_acquire().is_none());

        a.release();
        assert_eq!(sem.available(), 1);
        drop(b);
        assert_eq!(sem.available(), 2);
        assert_eq!(sem.available() + sem.held(), sem.capacity());
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = Semaphore::new(0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_not_counted() {
        let sem = Semaphore::new(1);
        let _held = sem.acquire().await;

        let pending = tokio::time::timeout(std::time::Duration::from_millis(5), sem.acquire()).await;
        assert!(pending.is_err());
        assert_eq!(sem.waiting(), 0);
    }
}
