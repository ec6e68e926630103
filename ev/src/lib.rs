//! evio - event-driven asynchronous I/O engine
//!
//! evio gives higher-level protocol code a Node-style foundation: named
//! events with synchronous listener dispatch, TCP streams that frame their
//! input and account for their writes, and a worker pool whose results come
//! back on the I/O thread.
//!
//! # Core Concepts
//!
//! - **One I/O thread**: every emission and every stream state change runs on
//!   the thread owned by an [`IoContext`]
//! - **Errors are values**: transport and task failures arrive as
//!   [`ErrorValue`]s on `error` events or completion closures, never as
//!   panics crossing threads
//! - **Self-owned objects**: a [`LifecycleGuard`] keeps an object alive until
//!   it emits its terminal event
//!
//! # Modules
//!
//! - [`events`] - Event bus, payloads, capability traits, lifecycle registry
//! - [`stream`] - Async TCP streams, read framing, and the stream server
//! - [`tasks`] - Background work queue
//! - [`context`] - The I/O thread
//! - [`error_value`] - Structured, chainable error values
//! - [`config`] - Configuration types and loading
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod context;
pub mod error_value;
pub mod events;
pub mod logging;
pub mod stream;
pub mod tasks;

pub use config::Config;
pub use context::{ContextError, IoContext, IoHandle};
pub use error_value::ErrorValue;
pub use events::{
    Callback, DispatchMode, EventArgs, EventBus, EventError, HasEventBus, LifecycleGuard, ListenerId, StandardEvents,
    StreamEvents,
};
pub use stream::{AsyncStream, ReadMode, Readable, StreamError, StreamServer, Writable};
pub use tasks::{Completion, TaskId, TaskQueue};
