//! # Resource Pool
//!
//! Fixed-capacity pool of session handles. A checkout is a [`Pooled`] guard
//! that gives the handle back when released or dropped, so a handle can only
//! be returned once and only by whoever checked it out.
//!
//! ## Usage
//! ```rust,no_run
//! # async fn demo() -> Result<(), realm_core::pool::PoolError> {
//! use realm_core::pool::Pool;
//!
//! let pool = Pool::with(4, |i| format!("session-{i}"));
//! let session = pool.acquire().await?;
//! assert!(session.starts_with("session-"));
//! session.release();
//! # Ok(())
//! # }
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Pool errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every handle is checked out.
    #[error("Pool exhausted")]
    Busy,

    /// No handle was freed in time.
    #[error("Timed out waiting for a pooled handle")]
    Timeout,

    /// The pool was closed.
    #[error("Pool closed")]
    Closed,
}

struct Shared<T> {
    items: Mutex<Vec<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Bounded pool of `T`.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Pool<T> {
    /// Create a pool owning `items`. Capacity is the number of items.
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(items),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    /// Create a pool of `capacity` items built by `make`.
    #[must_use]
    pub fn with(capacity: usize, make: impl FnMut(usize) -> T) -> Self {
        Self::new((0..capacity).map(make).collect())
    }

    /// Wait for a free handle. Waiters are served in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool is closed.
    pub async fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.checkout(permit)
    }

    /// Take a free handle without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Busy`] when every handle is out.
    pub fn try_acquire(&self) -> Result<Pooled<T>, PoolError> {
        let permit = self
            .shared
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Busy,
                TryAcquireError::Closed => PoolError::Closed,
            })?;
        self.checkout(permit)
    }

    /// Wait at most `timeout` for a free handle.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if none was freed in time.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Pooled<T>, PoolError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| PoolError::Timeout)?
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<Pooled<T>, PoolError> {
        // A permit is only granted while an item sits in the free list.
        let item = self.shared.items.lock().pop().ok_or(PoolError::Closed)?;
        Ok(Pooled {
            item: Some(item),
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Stop handing out handles. Outstanding checkouts stay valid.
    pub fn close(&self) {
        self.shared.permits.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handles currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Handles currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.capacity - self.shared.items.lock().len()
    }
}

/// A checked-out handle. Returned to the pool on release or drop.
pub struct Pooled<T> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
    // Dropped after the item is back in the free list.
    _permit: OwnedSemaphorePermit,
}

impl<T> Pooled<T> {
    /// Return the handle to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.shared.items.lock().push(item);
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only empty inside drop.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_basic() {
        let pool = Pool::with(3, |i| i);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);

        let mut handle = pool.acquire().await.unwrap();
        *handle += 10;
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 1);

        handle.release();
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire_busy() {
        let pool = Pool::with(1, |_| ());
        let held = pool.try_acquire().unwrap();
        assert_eq!(pool.try_acquire().err(), Some(PoolError::Busy));

        drop(held);
        assert!(pool.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_acquire_waits_for_release() {
        let pool = Pool::with(2, |i| i);
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await.unwrap() })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.outstanding(), 2);

        let value = *first;
        first.release();
        assert_eq!(waiter.await.unwrap(), value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let pool = Pool::with(1, |_| "db");
        let _held = pool.acquire().await.unwrap();

        let result = pool.acquire_timeout(Duration::from_millis(250)).await;
        assert_eq!(result.err(), Some(PoolError::Timeout));
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = Pool::with(1, |_| ());
        let held = pool.acquire().await.unwrap();
        pool.close();

        assert!(pool.is_closed());
        assert_eq!(pool.try_acquire().err(), Some(PoolError::Closed));
        assert_eq!(pool.acquire().await.err(), Some(PoolError::Closed));
        held.release();
    }
}
