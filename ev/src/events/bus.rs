//! Event Bus - named-event listener registry and synchronous emission
//!
//! Listeners are kept per event name in registration order. `emit` runs every
//! listener registered at the moment of the call, in that order, on the
//! calling thread, then retires the one-shot listeners it fired. Changes to
//! the registry are announced through `listener_added` / `listener_removed`
//! meta-events.
//!
//! All emission for a bus is expected to happen on its I/O thread. The lock
//! around the registry is only ever held for bookkeeping, never while a
//! listener runs, so listeners are free to add, remove, and emit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::args::{Callback, DispatchMode, EventArgs};
use super::{ERROR, LISTENER_ADDED, LISTENER_REMOVED, SELF_DESTRUCT_SUFFIX};
use crate::config::EventsConfig;

/// Default per-event listener limit
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Nesting limit for emissions triggered from inside listeners
pub const MAX_EMIT_DEPTH: usize = 100;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, monotonically increasing listener identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Usage errors raised by the bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event name must not be empty")]
    InvalidEventName,

    #[error("event '{event}' already has the maximum of {max} listeners")]
    ResourceExhausted { event: String, max: usize },

    #[error("emit depth exceeded {max} while emitting '{event}'")]
    EmitDepthExceeded { event: String, max: usize },

    #[error("{id} on '{event}' accepts {expected} arguments but was emitted {got}")]
    TypeMismatch {
        event: String,
        id: ListenerId,
        expected: &'static str,
        got: &'static str,
    },
}

struct Listener {
    id: ListenerId,
    callback: Callback,
    once: bool,
}

struct BusInner {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    max_listeners: AtomicUsize,
    dispatch: DispatchMode,
    depth: AtomicUsize,
    /// Event whose nested emission overflowed, reported by the outermost emit
    overflowed: Mutex<Option<String>>,
}

/// Named-event bus
///
/// Cloning is cheap and yields a handle to the same registry, which is how
/// delegating components attach to a bus they do not own.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Decrements the emit depth when an emission unwinds
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn validate(event: &str) -> Result<(), EventError> {
    if event.is_empty() {
        return Err(EventError::InvalidEventName);
    }
    Ok(())
}

impl EventBus {
    /// Create a bus with the default listener limit and lenient dispatch
    pub fn new() -> Self {
        Self::with_options(DEFAULT_MAX_LISTENERS, DispatchMode::default())
    }

    /// Create a bus from the `events` configuration section
    pub fn from_config(config: &EventsConfig) -> Self {
        Self::with_options(config.max_listeners, config.dispatch)
    }

    /// Create a bus with an explicit listener limit (0 = unlimited) and dispatch mode
    pub fn with_options(max_listeners: usize, dispatch: DispatchMode) -> Self {
        trace!(max_listeners, ?dispatch, "EventBus::with_options");
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                max_listeners: AtomicUsize::new(max_listeners),
                dispatch,
                depth: AtomicUsize::new(0),
                overflowed: Mutex::new(None),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Vec<Listener>>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener and return its id
    ///
    /// Fails with `ResourceExhausted` when the event already holds the maximum
    /// number of listeners. On success `listener_added` is emitted before
    /// returning, except when registering for `listener_added` itself. A
    /// failing meta-listener is logged and does not undo the registration.
    pub fn add_listener(&self, event: &str, callback: Callback, once: bool) -> Result<ListenerId, EventError> {
        validate(event)?;
        let id = ListenerId::next();
        {
            let mut registry = self.registry();
            let list = registry.entry(event.to_string()).or_default();
            let max = self.max_listeners();
            if max != 0 && list.len() >= max {
                debug!(%event, max, "EventBus::add_listener: listener limit reached");
                return Err(EventError::ResourceExhausted {
                    event: event.to_string(),
                    max,
                });
            }
            list.push(Listener { id, callback, once });
        }
        debug!(%event, %id, once, "EventBus::add_listener: registered");

        if event != LISTENER_ADDED {
            self.announce(LISTENER_ADDED, event, id);
        }
        Ok(id)
    }

    /// Register a persistent listener
    pub fn on(&self, event: &str, callback: Callback) -> Result<ListenerId, EventError> {
        self.add_listener(event, callback, false)
    }

    /// Register a listener that is removed after the next emission
    pub fn once(&self, event: &str, callback: Callback) -> Result<ListenerId, EventError> {
        self.add_listener(event, callback, true)
    }

    /// Remove a listener by id; returns whether it was registered
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> Result<bool, EventError> {
        validate(event)?;
        let removed = self.take_matching(event, |l| l.id == id);
        self.announce_removed(event, &removed);
        Ok(!removed.is_empty())
    }

    /// Remove every registration of the given closure for an event
    pub fn remove_callback(&self, event: &str, callback: &Callback) -> Result<bool, EventError> {
        validate(event)?;
        let removed = self.take_matching(event, |l| l.callback.same_as(callback));
        self.announce_removed(event, &removed);
        Ok(!removed.is_empty())
    }

    /// Remove all listeners for one event, or for every event when `None`
    ///
    /// Returns the number of listeners removed.
    pub fn remove_all_listeners(&self, event: Option<&str>) -> Result<usize, EventError> {
        let drained: Vec<(String, Vec<ListenerId>)> = {
            let mut registry = self.registry();
            match event {
                Some(name) => {
                    validate(name)?;
                    registry
                        .remove(name)
                        .map(|list| vec![(name.to_string(), list.into_iter().map(|l| l.id).collect())])
                        .unwrap_or_default()
                }
                None => registry
                    .drain()
                    .map(|(name, list)| (name, list.into_iter().map(|l| l.id).collect()))
                    .collect(),
            }
        };

        let mut count = 0;
        for (name, ids) in &drained {
            count += ids.len();
            self.announce_removed(name, ids);
        }
        debug!(?event, count, "EventBus::remove_all_listeners");
        Ok(count)
    }

    fn take_matching(&self, event: &str, pred: impl Fn(&Listener) -> bool) -> Vec<ListenerId> {
        let mut registry = self.registry();
        let Some(list) = registry.get_mut(event) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        list.retain(|l| {
            if pred(l) {
                removed.push(l.id);
                false
            } else {
                true
            }
        });
        if list.is_empty() {
            registry.remove(event);
        }
        removed
    }

    /// Emit a listener meta-event; the change it reports already happened
    fn announce(&self, meta: &str, event: &str, id: ListenerId) {
        let args = EventArgs::Listener {
            event: event.to_string(),
            id,
        };
        if let Err(e) = self.emit(meta, args) {
            warn!(%meta, %event, %id, error = %e, "EventBus: meta listener failed");
        }
    }

    fn announce_removed(&self, event: &str, ids: &[ListenerId]) {
        if event == LISTENER_REMOVED {
            return;
        }
        for id in ids {
            debug!(%event, %id, "EventBus: listener removed");
            self.announce(LISTENER_REMOVED, event, *id);
        }
    }

    /// Invoke every listener registered for `event`, in registration order
    ///
    /// Shape mismatches do not stop the pass; the first one is returned after
    /// all listeners ran. Once-listeners that fired are removed afterwards,
    /// and `<event>_selfdestruct` is emitted last when anything listens for it.
    pub fn emit(&self, event: &str, mut args: EventArgs) -> Result<(), EventError> {
        validate(event)?;
        if let EventArgs::Error(e) = &mut args {
            e.freeze();
        }

        let depth = self.inner.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = DepthGuard(&self.inner.depth);
        if depth > MAX_EMIT_DEPTH {
            warn!(%event, depth, "EventBus::emit: emit depth exceeded");
            self.inner
                .overflowed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| event.to_string());
            return Err(EventError::EmitDepthExceeded {
                event: event.to_string(),
                max: MAX_EMIT_DEPTH,
            });
        }

        let snapshot: Vec<(ListenerId, Callback, bool)> = self
            .registry()
            .get(event)
            .map(|list| list.iter().map(|l| (l.id, l.callback.clone(), l.once)).collect())
            .unwrap_or_default();
        trace!(%event, depth, listeners = snapshot.len(), args = ?args, "EventBus::emit");

        if event == ERROR && snapshot.is_empty() {
            warn!(args = ?args, "EventBus::emit: unhandled error event");
        }

        let mut result = Ok(());
        for (id, callback, _) in &snapshot {
            if let Err(mismatch) = callback.invoke(&args, self.inner.dispatch) {
                warn!(%event, %id, expected = mismatch.expected, got = mismatch.got, "EventBus::emit: type mismatch");
                if result.is_ok() {
                    result = Err(EventError::TypeMismatch {
                        event: event.to_string(),
                        id: *id,
                        expected: mismatch.expected,
                        got: mismatch.got,
                    });
                }
            }
        }

        let fired_once: Vec<ListenerId> = snapshot.iter().filter(|(_, _, once)| *once).map(|(id, _, _)| *id).collect();
        if !fired_once.is_empty() {
            let removed = self.take_matching(event, |l| fired_once.contains(&l.id));
            self.announce_removed(event, &removed);
        }

        if !event.ends_with(SELF_DESTRUCT_SUFFIX) {
            let teardown = format!("{event}{SELF_DESTRUCT_SUFFIX}");
            if self.listener_count(&teardown) > 0 {
                debug!(%event, "EventBus::emit: running self-destruct listeners");
                if let Err(e) = self.emit(&teardown, args) {
                    result = result.and(Err(e));
                }
            }
        }

        drop(guard);
        if depth == 1
            && let Some(overflowed) = self.inner.overflowed.lock().unwrap_or_else(PoisonError::into_inner).take()
        {
            return Err(EventError::EmitDepthExceeded {
                event: overflowed,
                max: MAX_EMIT_DEPTH,
            });
        }
        result
    }

    /// Number of listeners currently registered for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry().get(event).map_or(0, Vec::len)
    }

    /// Names of events that currently have listeners
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }

    /// Change the per-event listener limit (0 = unlimited)
    pub fn set_max_listeners(&self, max: usize) {
        debug!(max, "EventBus::set_max_listeners");
        self.inner.max_listeners.store(max, Ordering::Relaxed);
    }

    pub fn max_listeners(&self) -> usize {
        self.inner.max_listeners.load(Ordering::Relaxed)
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.inner.dispatch
    }

    /// Current emission nesting depth (0 when idle)
    pub fn emit_depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Forward every emission of `event` to `target_event` on another bus
    ///
    /// The forwarding listener only holds a weak handle, so it never keeps the
    /// target alive.
    pub fn delegate_to(&self, event: &str, target: &EventBus, target_event: &str) -> Result<ListenerId, EventError> {
        validate(target_event)?;
        let weak: Weak<BusInner> = Arc::downgrade(&target.inner);
        let target_event = target_event.to_string();
        debug!(%event, %target_event, "EventBus::delegate_to");
        self.on(
            event,
            Callback::any(move |args| {
                if let Some(inner) = weak.upgrade() {
                    let target = EventBus { inner };
                    if let Err(e) = target.emit(&target_event, args.clone()) {
                        warn!(error = %e, %target_event, "EventBus::delegate_to: forward failed");
                    }
                }
            }),
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_names())
            .field("max_listeners", &self.max_listeners())
            .field("dispatch", &self.inner.dispatch)
            .finish()
    }
}
