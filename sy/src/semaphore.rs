//! Counting semaphore built on a mutex and condition variable
//!
//! Besides the classic notify/wait pair, the semaphore can be used as a live
//! counter: `notify_below` increments only while under a bound, and
//! `wait_until_zero` blocks until the count drains back to zero. The worker
//! pool uses it that way to track live workers.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

/// Counting semaphore
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// Create a semaphore with an initial count
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current count
    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Increment the count and wake waiters
    pub fn notify(&self) {
        let mut count = self.lock();
        *count += 1;
        trace!(count = *count, "Semaphore::notify");
        self.condvar.notify_all();
    }

    /// Increment the count only if it is currently below `limit`
    ///
    /// Returns true if the count was incremented. The check and the increment
    /// happen under one lock, so concurrent callers never push the count past
    /// the limit.
    pub fn notify_below(&self, limit: usize) -> bool {
        let mut count = self.lock();
        if *count >= limit {
            return false;
        }
        *count += 1;
        trace!(count = *count, limit, "Semaphore::notify_below");
        self.condvar.notify_all();
        true
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) {
        let mut count = self.lock();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
        self.condvar.notify_all();
    }

    /// Decrement the count if it is positive, without blocking
    pub fn try_wait(&self) -> bool {
        let mut count = self.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        trace!(count = *count, "Semaphore::try_wait: decremented");
        self.condvar.notify_all();
        true
    }

    /// Wait up to `timeout` for the count to become positive, then decrement it
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();
        while *count == 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            count = self
                .condvar
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        self.condvar.notify_all();
        true
    }

    /// Block until the count reaches zero
    pub fn wait_until_zero(&self) {
        let mut count = self.lock();
        while *count != 0 {
            count = self.condvar.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait up to `timeout` for the count to reach zero
    ///
    /// Returns true if the count is zero on return.
    pub fn wait_until_zero_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();
        while *count != 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            count = self
                .condvar
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
