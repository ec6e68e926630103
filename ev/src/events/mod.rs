//! Event system - Node-style named events with synchronous dispatch
//!
//! Every component that reports progress owns an [`EventBus`]. Callers
//! register listeners by event name, then kick off an asynchronous operation;
//! when it completes, the I/O thread emits the matching event and the
//! listeners run in registration order.
//!
//! # Usage
//!
//! ```rust,ignore
//! use evio::events::{Callback, EventArgs, EventBus};
//!
//! let bus = EventBus::new();
//! bus.on("closed", Callback::unit(|| println!("closed")))?;
//! bus.emit("closed", EventArgs::None)?;
//! ```
//!
//! # Standard events
//!
//! | Event                  | Payload                         |
//! |------------------------|---------------------------------|
//! | `connect`              | none                            |
//! | `data_received`        | bytes, end-of-stream flag       |
//! | `write_completion`     | none                            |
//! | `all_writes_completed` | none                            |
//! | `closed`               | none                            |
//! | `error`                | `ErrorValue`                    |
//! | `exit`                 | optional `ErrorValue`           |
//! | `listener_added`       | event name, listener id         |
//! | `listener_removed`     | event name, listener id         |

mod args;
mod bus;
mod lifecycle;
mod traits;

pub use args::{Callback, DispatchMode, EventArgs, ShapeMismatch};
pub use bus::{DEFAULT_MAX_LISTENERS, EventBus, EventError, ListenerId, MAX_EMIT_DEPTH};
pub use lifecycle::LifecycleGuard;
pub use traits::{HasEventBus, StandardEvents, StreamEvents};

pub const CONNECT: &str = "connect";
pub const DATA_RECEIVED: &str = "data_received";
pub const WRITE_COMPLETION: &str = "write_completion";
pub const ALL_WRITES_COMPLETED: &str = "all_writes_completed";
pub const CLOSED: &str = "closed";
pub const ERROR: &str = "error";
pub const EXIT: &str = "exit";
pub const LISTENER_ADDED: &str = "listener_added";
pub const LISTENER_REMOVED: &str = "listener_removed";

/// Emitted by a server once it is bound
pub const LISTENING: &str = "listening";

/// Emitted by a server for each accepted stream
pub const CONNECTION: &str = "connection";

/// Suffix of the teardown event emitted after an event's ordinary listeners
pub const SELF_DESTRUCT_SUFFIX: &str = "_selfdestruct";
