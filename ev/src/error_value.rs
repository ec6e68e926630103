//! ErrorValue - structured, chainable error carried through events
//!
//! Failures never cross a thread boundary as a raw panic or an unwinding
//! error; they travel as an `ErrorValue`. The value holds an ordered set of
//! named string fields (always including `description`), an optional child
//! error forming a cause chain, and optionally a captured panic payload that
//! can be resumed later on another thread.
//!
//! A value is mutable until it is frozen. Attaching a value as another
//! error's child freezes it, and so does emitting it on an `error` event.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// Field name holding the human-readable description
pub const DESCRIPTION: &str = "description";

/// Field name identifying the operation that failed
pub const WHERE: &str = "where";

/// Errors from mutating an ErrorValue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorValueError {
    #[error("error value is frozen; cannot set field '{0}'")]
    Frozen(String),
}

type Payload = Box<dyn Any + Send + 'static>;

/// Shared slot for a captured panic payload
///
/// Clones of an ErrorValue share the slot, so the payload can be resumed at
/// most once no matter how many listeners saw the error.
#[derive(Clone)]
struct PanicSlot(Arc<Mutex<Option<Payload>>>);

impl PanicSlot {
    fn take(&self) -> Option<Payload> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn is_present(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Structured error value
#[derive(Clone)]
pub struct ErrorValue {
    fields: Vec<(String, String)>,
    frozen: bool,
    child: Option<Box<ErrorValue>>,
    panic: Option<PanicSlot>,
}

impl ErrorValue {
    /// Create an unfrozen error with the given description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            fields: vec![(DESCRIPTION.to_string(), description.into())],
            frozen: false,
            child: None,
            panic: None,
        }
    }

    /// Convert an I/O failure, recording the operation that produced it
    pub fn from_io_error(err: &io::Error, location: &str) -> Self {
        let mut value = Self::new(err.to_string())
            .with(WHERE, location)
            .with("kind", format!("{:?}", err.kind()));
        if let Some(code) = err.raw_os_error() {
            value = value.with("os_error", code.to_string());
        }
        value
    }

    /// Wrap a caught panic, keeping the payload so it can be resumed later
    pub fn from_panic(payload: Payload, location: &str) -> Self {
        let message = panic_message(payload.as_ref());
        let mut value = Self::new(format!("panic: {message}")).with(WHERE, location);
        value.panic = Some(PanicSlot(Arc::new(Mutex::new(Some(payload)))));
        value
    }

    /// Builder form of [`ErrorValue::add`]
    ///
    /// Only meaningful on a value that has not been frozen yet; on a frozen
    /// value the field is dropped and a warning is logged.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Err(e) = self.add(name, value) {
            tracing::warn!(error = %e, "ErrorValue::with: ignored field on frozen value");
        }
        self
    }

    /// Builder form of [`ErrorValue::set_child`]
    pub fn with_child(mut self, child: ErrorValue) -> Self {
        if let Err(e) = self.set_child(child) {
            tracing::warn!(error = %e, "ErrorValue::with_child: ignored child on frozen value");
        }
        self
    }

    /// Set a named field, replacing any previous value with the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), ErrorValueError> {
        let name = name.into();
        if self.frozen {
            return Err(ErrorValueError::Frozen(name));
        }
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
        Ok(())
    }

    /// Attach a cause; the child is frozen as part of the chain
    pub fn set_child(&mut self, mut child: ErrorValue) -> Result<(), ErrorValueError> {
        if self.frozen {
            return Err(ErrorValueError::Frozen("child".to_string()));
        }
        child.freeze();
        self.child = Some(Box::new(child));
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn description(&self) -> &str {
        self.get(DESCRIPTION).unwrap_or_default()
    }

    /// The `where` field, if the failure site recorded one
    pub fn location(&self) -> Option<&str> {
        self.get(WHERE)
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// All fields in insertion order, `description` first
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn child(&self) -> Option<&ErrorValue> {
        self.child.as_deref()
    }

    /// Depth-first walk of the cause chain, starting with this value
    pub fn chain(&self) -> impl Iterator<Item = &ErrorValue> {
        std::iter::successors(Some(self), |e| e.child())
    }

    /// Whether a panic payload is still waiting to be resumed
    pub fn has_panic(&self) -> bool {
        self.panic.as_ref().is_some_and(PanicSlot::is_present)
    }

    /// Take the captured panic payload out of the error
    pub fn take_panic(&self) -> Option<Payload> {
        self.panic.as_ref().and_then(PanicSlot::take)
    }

    /// Re-raise the captured panic on the current thread
    ///
    /// Does nothing if no payload was captured or it was already taken.
    pub fn resume_panic(&self) {
        if let Some(payload) = self.take_panic() {
            std::panic::resume_unwind(payload);
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let prefix = "# ".repeat(depth);
        writeln!(f, "{prefix}Description: {}", self.description())?;
        for (name, value) in self.fields().filter(|(k, _)| *k != DESCRIPTION) {
            writeln!(f, "{prefix}'{name}',\t'{value}'")?;
        }
        if let Some(child) = self.child() {
            child.render(f, depth + 1)?;
        }
        Ok(())
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl fmt::Debug for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorValue")
            .field("fields", &self.fields)
            .field("frozen", &self.frozen)
            .field("child", &self.child)
            .field("panic", &self.has_panic())
            .finish()
    }
}

impl std::error::Error for ErrorValue {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.child.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl Serialize for ErrorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.child.is_some());
        let mut map = serializer.serialize_map(Some(self.fields.len() + extra))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        if let Some(child) = &self.child {
            map.serialize_entry("child", child.as_ref())?;
        }
        map.end()
    }
}

impl From<io::Error> for ErrorValue {
    fn from(err: io::Error) -> Self {
        Self::from_io_error(&err, "io")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_description() {
        let err = ErrorValue::new("boom");
        assert_eq!(err.description(), "boom");
        assert_eq!(err.get(DESCRIPTION), Some("boom"));
        assert!(!err.is_frozen());
        assert!(err.child().is_none());
    }

    #[test]
    fn test_add_replaces_existing_field() {
        let mut err = ErrorValue::new("boom");
        err.add("where", "connect").unwrap();
        err.add("where", "read").unwrap();
        assert_eq!(err.location(), Some("read"));
        assert_eq!(err.fields().count(), 2);
    }

    #[test]
    fn test_frozen_value_rejects_fields() {
        let mut err = ErrorValue::new("boom");
        err.freeze();
        assert_eq!(
            err.add("where", "x"),
            Err(ErrorValueError::Frozen("where".to_string()))
        );
        assert!(err.location().is_none());
    }

    #[test]
    fn test_child_is_frozen_when_attached() {
        let child = ErrorValue::new("inner");
        let parent = ErrorValue::new("outer").with_child(child);
        assert!(parent.child().unwrap().is_frozen());
        assert!(!parent.is_frozen());
    }

    #[test]
    fn test_render_plain() {
        let err = ErrorValue::new("connection refused").with("where", "connect");
        assert_eq!(err.to_string(), "Description: connection refused\n'where',\t'connect'\n");
    }

    #[test]
    fn test_render_nested_prefixes_each_level() {
        let inner = ErrorValue::new("inner").with("code", "7");
        let middle = ErrorValue::new("middle").with_child(inner);
        let outer = ErrorValue::new("outer").with("where", "read").with_child(middle);
        let expected = "Description: outer\n\
                        'where',\t'read'\n\
                        # Description: middle\n\
                        # # Description: inner\n\
                        # # 'code',\t'7'\n";
        assert_eq!(outer.to_string(), expected);
    }

    #[test]
    fn test_chain_and_source() {
        use std::error::Error;
        let err = ErrorValue::new("a").with_child(ErrorValue::new("b").with_child(ErrorValue::new("c")));
        let descriptions: Vec<_> = err.chain().map(|e| e.description().to_string()).collect();
        assert_eq!(descriptions, vec!["a", "b", "c"]);
        assert_eq!(err.source().unwrap().to_string(), "Description: b\n# Description: c\n");
    }

    #[test]
    fn test_from_io_error_records_location() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ErrorValue::from_io_error(&io_err, "connect");
        assert_eq!(err.location(), Some("connect"));
        assert_eq!(err.get("kind"), Some("ConnectionRefused"));
        assert_eq!(err.description(), "refused");
    }

    #[test]
    fn test_panic_payload_resumes_once() {
        let payload = std::panic::catch_unwind(|| {
            panic!("kaboom");
        })
        .unwrap_err();
        let err = ErrorValue::from_panic(payload, "worker#execute");
        assert!(err.description().contains("kaboom"));
        assert!(err.has_panic());

        let clone = err.clone();
        let resumed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| clone.resume_panic()));
        assert!(resumed.is_err());
        assert!(!err.has_panic());
        // Second resume is a no-op
        err.resume_panic();
    }

    #[test]
    fn test_serialize_includes_child() {
        let err = ErrorValue::new("outer").with("where", "write").with_child(ErrorValue::new("inner"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["description"], "outer");
        assert_eq!(json["where"], "write");
        assert_eq!(json["child"]["description"], "inner");
    }
}
