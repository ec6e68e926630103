//! Event payloads and listener callbacks
//!
//! Every event carries one of a small, closed set of argument shapes, and
//! every listener is stored as the matching closure shape. Dispatch is a
//! `match` over the pair; there is no runtime type casting.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::bus::ListenerId;
use crate::error_value::ErrorValue;

/// Payload of a single emission
#[derive(Clone)]
pub enum EventArgs {
    /// No payload (`connect`, `closed`, `write_completion`, ...)
    None,
    /// A delivered frame and whether it ends the stream
    Data { bytes: Bytes, eof: bool },
    Error(ErrorValue),
    Endpoint(SocketAddr),
    Exit(Option<ErrorValue>),
    /// Meta-event payload for `listener_added` / `listener_removed`
    Listener { event: String, id: ListenerId },
    /// Anything else, shared by reference
    Value(Arc<dyn Any + Send + Sync>),
}

impl EventArgs {
    /// Short name of the argument shape, used in mismatch reports
    pub fn shape(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Data { .. } => "data",
            Self::Error(_) => "error",
            Self::Endpoint(_) => "endpoint",
            Self::Exit(_) => "exit",
            Self::Listener { .. } => "listener",
            Self::Value(_) => "value",
        }
    }

    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(Arc::new(value))
    }
}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Data { bytes, eof } => f
                .debug_struct("Data")
                .field("len", &bytes.len())
                .field("eof", eof)
                .finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Endpoint(addr) => f.debug_tuple("Endpoint").field(addr).finish(),
            Self::Exit(e) => f.debug_tuple("Exit").field(e).finish(),
            Self::Listener { event, id } => f
                .debug_struct("Listener")
                .field("event", event)
                .field("id", id)
                .finish(),
            Self::Value(_) => write!(f, "Value(..)"),
        }
    }
}

/// How a listener whose shape does not match the payload is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Zero-argument listeners ignore whatever payload the event carries
    #[default]
    Lenient,
    /// Every listener must match the payload shape exactly
    Strict,
}

/// Shape disagreement between a listener and an emitted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub expected: &'static str,
    pub got: &'static str,
}

/// A stored listener closure
#[derive(Clone)]
pub enum Callback {
    Unit(Arc<dyn Fn() + Send + Sync>),
    Data(Arc<dyn Fn(&Bytes, bool) + Send + Sync>),
    Error(Arc<dyn Fn(&ErrorValue) + Send + Sync>),
    Endpoint(Arc<dyn Fn(SocketAddr) + Send + Sync>),
    Exit(Arc<dyn Fn(Option<&ErrorValue>) + Send + Sync>),
    Listener(Arc<dyn Fn(&str, ListenerId) + Send + Sync>),
    Value(Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>),
    /// Receives the raw payload, whatever its shape
    Any(Arc<dyn Fn(&EventArgs) + Send + Sync>),
}

impl Callback {
    pub fn unit(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self::Unit(Arc::new(f))
    }

    pub fn data(f: impl Fn(&Bytes, bool) + Send + Sync + 'static) -> Self {
        Self::Data(Arc::new(f))
    }

    pub fn error(f: impl Fn(&ErrorValue) + Send + Sync + 'static) -> Self {
        Self::Error(Arc::new(f))
    }

    pub fn endpoint(f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        Self::Endpoint(Arc::new(f))
    }

    pub fn exit(f: impl Fn(Option<&ErrorValue>) + Send + Sync + 'static) -> Self {
        Self::Exit(Arc::new(f))
    }

    pub fn listener(f: impl Fn(&str, ListenerId) + Send + Sync + 'static) -> Self {
        Self::Listener(Arc::new(f))
    }

    pub fn value(f: impl Fn(&(dyn Any + Send + Sync)) + Send + Sync + 'static) -> Self {
        Self::Value(Arc::new(f))
    }

    pub fn any(f: impl Fn(&EventArgs) + Send + Sync + 'static) -> Self {
        Self::Any(Arc::new(f))
    }

    /// Short name of the argument shape this callback accepts
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Unit(_) => "none",
            Self::Data(_) => "data",
            Self::Error(_) => "error",
            Self::Endpoint(_) => "endpoint",
            Self::Exit(_) => "exit",
            Self::Listener(_) => "listener",
            Self::Value(_) => "value",
            Self::Any(_) => "any",
        }
    }

    /// Whether both callbacks share the same closure allocation
    pub fn same_as(&self, other: &Callback) -> bool {
        use std::ptr::addr_eq;
        match (self, other) {
            (Self::Unit(a), Self::Unit(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Data(a), Self::Data(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Error(a), Self::Error(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Endpoint(a), Self::Endpoint(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Exit(a), Self::Exit(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Listener(a), Self::Listener(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Value(a), Self::Value(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Any(a), Self::Any(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }

    /// Call the closure with the payload, if the shapes line up
    pub(crate) fn invoke(&self, args: &EventArgs, mode: DispatchMode) -> Result<(), ShapeMismatch> {
        match (self, args) {
            (Self::Any(f), args) => f(args),
            (Self::Unit(f), EventArgs::None) => f(),
            // Zero-argument fallback: fire-and-forget listeners skip the payload
            (Self::Unit(f), _) if mode == DispatchMode::Lenient => f(),
            (Self::Data(f), EventArgs::Data { bytes, eof }) => f(bytes, *eof),
            (Self::Error(f), EventArgs::Error(e)) => f(e),
            (Self::Endpoint(f), EventArgs::Endpoint(addr)) => f(*addr),
            (Self::Exit(f), EventArgs::Exit(e)) => f(e.as_ref()),
            (Self::Listener(f), EventArgs::Listener { event, id }) => f(event, *id),
            (Self::Value(f), EventArgs::Value(v)) => f(v.as_ref()),
            _ => {
                return Err(ShapeMismatch {
                    expected: self.shape(),
                    got: args.shape(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback<{}>", self.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_matching_shapes_invoke() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb = Callback::data(move |bytes, eof| {
            assert_eq!(bytes.as_ref(), b"abc");
            assert!(!eof);
            h.fetch_add(1, Ordering::SeqCst);
        });
        let args = EventArgs::Data {
            bytes: Bytes::from_static(b"abc"),
            eof: false,
        };
        assert!(cb.invoke(&args, DispatchMode::Strict).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unit_fallback_only_in_lenient_mode() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb = Callback::unit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let args = EventArgs::Error(ErrorValue::new("x"));

        assert!(cb.invoke(&args, DispatchMode::Lenient).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = cb.invoke(&args, DispatchMode::Strict).unwrap_err();
        assert_eq!(err, ShapeMismatch { expected: "none", got: "error" });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shape_mismatch_reported_in_both_modes() {
        let cb = Callback::error(|_| {});
        for mode in [DispatchMode::Lenient, DispatchMode::Strict] {
            let err = cb.invoke(&EventArgs::None, mode).unwrap_err();
            assert_eq!(err.expected, "error");
            assert_eq!(err.got, "none");
        }
    }

    #[test]
    fn test_any_accepts_everything() {
        let cb = Callback::any(|args| assert_eq!(args.shape(), "endpoint"));
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert!(cb.invoke(&EventArgs::Endpoint(addr), DispatchMode::Strict).is_ok());
    }

    #[test]
    fn test_value_downcast() {
        let cb = Callback::value(|v| assert_eq!(v.downcast_ref::<u32>(), Some(&42)));
        assert!(cb.invoke(&EventArgs::value(42u32), DispatchMode::Strict).is_ok());
    }

    #[test]
    fn test_same_as_compares_allocation() {
        let a = Callback::unit(|| {});
        let b = a.clone();
        let c = Callback::unit(|| {});
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }
}
