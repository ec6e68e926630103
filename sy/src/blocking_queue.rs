//! Multi-producer multi-consumer blocking queue
//!
//! FIFO queue guarded by one mutex with two condition variables. Consumers
//! block in `pop` until an item arrives or the queue is interrupted; an
//! interrupted queue wakes every blocked caller and refuses further pops until
//! `reset`. Producers only block when the queue was created bounded.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

/// Why a queue operation could not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue was interrupted")]
    Interrupted,

    #[error("queue is full")]
    Full,
}

/// A rejected push, handing the item back to the caller
pub struct PushError<T> {
    kind: QueueError,
    item: T,
}

impl<T> PushError<T> {
    /// Reason the push was rejected
    pub fn kind(&self) -> QueueError {
        self.kind
    }

    /// Recover the item that was not queued
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push rejected: {}", self.kind)
    }
}

impl<T> std::error::Error for PushError<T> {}

struct QueueState<T> {
    items: VecDeque<T>,
    interrupted: bool,
}

/// Blocking FIFO queue
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockingQueue")
            .field("len", &state.items.len())
            .field("interrupted", &state.interrupted)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue that holds at most `capacity` items
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self, state: &QueueState<T>) -> bool {
        self.capacity.is_some_and(|cap| state.items.len() >= cap)
    }

    /// Append an item, blocking while a bounded queue is full
    ///
    /// Fails only if the queue is interrupted while waiting for room.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        while self.is_full(&state) {
            if state.interrupted {
                return Err(PushError {
                    kind: QueueError::Interrupted,
                    item,
                });
            }
            state = self.not_full.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.items.push_back(item);
        trace!(len = state.items.len(), "BlockingQueue::push");
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append an item without blocking
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        if self.is_full(&state) {
            return Err(PushError {
                kind: QueueError::Full,
                item,
            });
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the front item, blocking until one arrives
    ///
    /// Returns None once the queue is interrupted.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            state = self.not_empty.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove the front item if there is one
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.interrupted {
            return None;
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove the front item, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_or_else(timeout, || {})
    }

    /// Remove the front item, waiting at most `timeout`; otherwise run `on_empty`
    ///
    /// `on_empty` runs while the queue lock is still held, so no producer can
    /// slip an item in between the decision to give up and the side effect it
    /// performs.
    pub fn pop_or_else<F>(&self, timeout: Duration, on_empty: F) -> Option<T>
    where
        F: FnOnce(),
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.interrupted
                && let Some(item) = state.items.pop_front()
            {
                self.not_full.notify_one();
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if state.interrupted || remaining.is_zero() {
                on_empty();
                return None;
            }
            state = self
                .not_empty
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake every blocked caller; pops fail until `reset`
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        debug!(len = state.items.len(), "BlockingQueue::interrupt");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Clear a previous interruption
    pub fn reset(&self) {
        let mut state = self.lock();
        state.interrupted = false;
    }

    /// Whether the queue is currently interrupted
    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Take every queued item, oldest first
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
