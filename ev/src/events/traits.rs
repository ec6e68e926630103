//! Capability traits composed by event-bearing components

use bytes::Bytes;

use super::{
    ALL_WRITES_COMPLETED, CLOSED, CONNECT, Callback, DATA_RECEIVED, ERROR, EXIT, EventArgs, EventBus, EventError,
    ListenerId, WRITE_COMPLETION,
};
use crate::error_value::{ErrorValue, WHERE};

/// A component that exposes its events through an [`EventBus`]
pub trait HasEventBus {
    fn event_bus(&self) -> &EventBus;
}

impl HasEventBus for EventBus {
    fn event_bus(&self) -> &EventBus {
        self
    }
}

/// Typed helpers for the events every component may raise
pub trait StandardEvents: HasEventBus {
    fn on_error(&self, f: impl Fn(&ErrorValue) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(ERROR, Callback::error(f))
    }

    /// Listen for the next `error` only
    fn on_next_error(&self, f: impl Fn(&ErrorValue) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().once(ERROR, Callback::error(f))
    }

    fn on_closed(&self, f: impl Fn() + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(CLOSED, Callback::unit(f))
    }

    fn on_exit(&self, f: impl Fn(Option<&ErrorValue>) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(EXIT, Callback::exit(f))
    }

    /// Emit `error`, tagging the value with `where` unless it already has one
    fn emit_error(&self, mut error: ErrorValue, location: &str) -> Result<(), EventError> {
        if error.location().is_none() && !error.is_frozen() {
            // Unfrozen values accept fields, so this cannot fail
            let _ = error.add(WHERE, location);
        }
        self.event_bus().emit(ERROR, EventArgs::Error(error))
    }

    fn emit_closed(&self) -> Result<(), EventError> {
        self.event_bus().emit(CLOSED, EventArgs::None)
    }

    fn emit_exit(&self, error: Option<ErrorValue>) -> Result<(), EventError> {
        self.event_bus().emit(EXIT, EventArgs::Exit(error))
    }
}

impl<T: HasEventBus + ?Sized> StandardEvents for T {}

/// Typed helpers for stream events
pub trait StreamEvents: HasEventBus {
    fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(CONNECT, Callback::unit(f))
    }

    fn on_data_received(&self, f: impl Fn(&Bytes, bool) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(DATA_RECEIVED, Callback::data(f))
    }

    fn on_write_completion(&self, f: impl Fn() + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(WRITE_COMPLETION, Callback::unit(f))
    }

    fn on_all_writes_completed(&self, f: impl Fn() + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.event_bus().on(ALL_WRITES_COMPLETED, Callback::unit(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_error_adds_location() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            bus.on_error(move |e| *seen.lock().unwrap() = e.location().map(str::to_string))
                .unwrap();
        }
        bus.emit_error(ErrorValue::new("boom"), "read").unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("read"));
    }

    #[test]
    fn test_emit_error_keeps_existing_location() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            bus.on_error(move |e| *seen.lock().unwrap() = e.location().map(str::to_string))
                .unwrap();
        }
        bus.emit_error(ErrorValue::new("boom").with(WHERE, "connect"), "read")
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("connect"));
    }

    #[test]
    fn test_on_next_error_fires_once() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        {
            let hits = hits.clone();
            bus.on_next_error(move |_| *hits.lock().unwrap() += 1).unwrap();
        }
        bus.emit_error(ErrorValue::new("a"), "x").unwrap();
        bus.emit_error(ErrorValue::new("b"), "x").unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_exit_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.on_exit(move |e| seen.lock().unwrap().push(e.map(|e| e.description().to_string())))
                .unwrap();
        }
        bus.emit_exit(None).unwrap();
        bus.emit_exit(Some(ErrorValue::new("stopped"))).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![None, Some("stopped".to_string())]);
    }
}
