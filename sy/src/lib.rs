//! evio-sync - blocking synchronization primitives
//!
//! The pieces of the engine that genuinely cross threads: a multi-producer
//! multi-consumer [`BlockingQueue`] that worker threads park on, and a counting
//! [`Semaphore`] used both as a permit counter and as a live-worker counter.
//!
//! # Modules
//!
//! - [`blocking_queue`] - FIFO queue with interruptible blocking pops
//! - [`semaphore`] - counting semaphore with wait-until-zero support

pub mod blocking_queue;
pub mod semaphore;

pub use blocking_queue::{BlockingQueue, PushError, QueueError};
pub use semaphore::Semaphore;
