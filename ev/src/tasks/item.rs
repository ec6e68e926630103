//! Work items and their execution at the worker boundary

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error_value::{ErrorValue, WHERE};

/// Task identifier, unique and increasing per queue
pub type TaskId = i64;

/// Body of a task, run on a worker thread
pub type TaskBody = Box<dyn FnOnce() -> Result<(), ErrorValue> + Send + 'static>;

/// Completion closure, run on the I/O thread with the task's outcome
pub type Completion = Box<dyn FnOnce(TaskId, Option<ErrorValue>) + Send + 'static>;

/// Location recorded on errors raised by a task body
pub const EXECUTE_LOCATION: &str = "worker#execute";

/// A unit of offloaded work
pub struct WorkItem {
    pub(crate) id: TaskId,
    body: TaskBody,
    completion: Option<Completion>,
}

impl WorkItem {
    pub fn new(id: TaskId, body: TaskBody, completion: Option<Completion>) -> Self {
        Self { id, body, completion }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Run the body, turning a returned error or a panic into an ErrorValue
    ///
    /// Hands back the completion closure so the caller can marshal it to the
    /// I/O thread.
    pub fn execute(self) -> (TaskId, Option<Completion>, Option<ErrorValue>) {
        let Self { id, body, completion } = self;
        let outcome = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => None,
            Ok(Err(mut error)) => {
                if error.location().is_none() && !error.is_frozen() {
                    let _ = error.add(WHERE, EXECUTE_LOCATION);
                }
                Some(error)
            }
            Err(payload) => Some(ErrorValue::from_panic(payload, EXECUTE_LOCATION)),
        };
        (id, completion, outcome)
    }

    /// Give up on the item without running it
    pub fn abandon(self, error: ErrorValue) -> (TaskId, Option<Completion>, Option<ErrorValue>) {
        (self.id, self.completion, Some(error))
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(f: impl FnOnce() -> Result<(), ErrorValue> + Send + 'static) -> TaskBody {
        Box::new(f)
    }

    #[test]
    fn test_successful_body() {
        let item = WorkItem::new(1, body(|| Ok(())), None);
        let (id, completion, outcome) = item.execute();
        assert_eq!(id, 1);
        assert!(completion.is_none());
        assert!(outcome.is_none());
    }

    #[test]
    fn test_returned_error_gets_location() {
        let item = WorkItem::new(2, body(|| Err(ErrorValue::new("bad input"))), None);
        let (_, _, outcome) = item.execute();
        let error = outcome.unwrap();
        assert_eq!(error.description(), "bad input");
        assert_eq!(error.location(), Some(EXECUTE_LOCATION));
    }

    #[test]
    fn test_returned_error_keeps_own_location() {
        let item = WorkItem::new(3, body(|| Err(ErrorValue::new("x").with(WHERE, "parse"))), None);
        let (_, _, outcome) = item.execute();
        assert_eq!(outcome.unwrap().location(), Some("parse"));
    }

    #[test]
    fn test_panic_is_captured() {
        let item = WorkItem::new(
            4,
            body(|| {
                panic!("exploded");
            }),
            Some(Box::new(|_: TaskId, _: Option<ErrorValue>| {})),
        );
        let (id, completion, outcome) = item.execute();
        assert_eq!(id, 4);
        assert!(completion.is_some());
        let error = outcome.unwrap();
        assert!(error.description().contains("exploded"));
        assert_eq!(error.location(), Some(EXECUTE_LOCATION));
        assert!(error.has_panic());
    }
}
