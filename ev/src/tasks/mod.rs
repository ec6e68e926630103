//! Background work queue
//!
//! Offloads blocking or CPU-heavy work to a bounded pool of worker threads
//! and brings each result back to the I/O thread through the task's
//! completion closure. Task bodies must not touch streams or buses directly;
//! everything they produce travels through the completion.

mod item;
mod queue;

pub use item::{Completion, EXECUTE_LOCATION, TaskBody, TaskId, WorkItem};
pub use queue::TaskQueue;
