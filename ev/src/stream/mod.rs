//! Asynchronous socket streams
//!
//! An [`AsyncStream`] wraps a TCP connection whose reads and writes run on
//! the I/O thread. Incoming bytes are cut into frames by the current
//! [`ReadMode`] and delivered on `data_received`; writes are counted so
//! `all_writes_completed` fires when the last one finishes.
//!
//! A [`StreamServer`] accepts connections and hands each one out as a new
//! stream on its `connection` event.

mod async_stream;
mod framing;
mod server;

pub use async_stream::AsyncStream;
pub use framing::{FrameRule, Predicate, ReadFramer, ReadMode};
pub use server::StreamServer;

use bytes::Bytes;
use thiserror::Error;

use crate::events::{EventError, HasEventBus};

/// Usage errors reported synchronously by stream operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is not connected")]
    NotConnected,

    #[error("stream is already connected or connecting")]
    AlreadyConnected,

    #[error("server is already listening")]
    AlreadyListening,

    #[error("stream is closed")]
    Closed,

    #[error("stream output has been ended")]
    Ended,

    #[error("delimiter must not be empty")]
    EmptyDelimiter,

    #[error("invalid read pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("pattern mode selected without a pattern")]
    MissingPattern,

    #[error("predicate mode selected without a predicate")]
    MissingPredicate,

    #[error("event error: {0}")]
    Event(#[from] EventError),
}

/// Read side of a stream
pub trait Readable: HasEventBus {
    /// Start delivering frames on `data_received`
    fn read_async(&self) -> Result<(), StreamError>;

    fn set_read_mode(&self, mode: ReadMode) -> Result<(), StreamError>;

    /// Set the delimiter, or a regular expression when `is_pattern` is true
    fn set_read_until(&self, value: &str, is_pattern: bool) -> Result<(), StreamError>;

    fn set_read_predicate(&self, predicate: Predicate);

    fn clear_read_predicate(&self);

    fn bytes_read(&self) -> u64;
}

/// Write side of a stream
pub trait Writable: HasEventBus {
    fn write_async(&self, data: Bytes) -> Result<(), StreamError>;

    /// Write any final bytes, then half-close the output
    fn end(&self, data: Option<Bytes>) -> Result<(), StreamError>;

    fn bytes_written(&self) -> u64;

    fn pending_writes(&self) -> usize;
}
