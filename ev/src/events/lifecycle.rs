//! LifecycleGuard - keep an object alive until it announces it is done
//!
//! Arming inserts a strong reference into a process-wide registry keyed by
//! the object's address, and registers a one-shot teardown listener on
//! `<event>_selfdestruct`. The bus emits that teardown event after the
//! ordinary listeners of `<event>`, so the registry's reference is released
//! only once everybody else has seen the terminal event.
//!
//! An object may be armed for several events at once; it has a single
//! registry entry that lists the pending events and is removed when the last
//! of them fires.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Callback, EventError, HasEventBus, ListenerId, SELF_DESTRUCT_SUFFIX};

struct Armed {
    object: Arc<dyn Any + Send + Sync>,
    events: Vec<String>,
}

static REGISTRY: LazyLock<Mutex<HashMap<usize, Armed>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<usize, Armed>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_of<T>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Deferred self-ownership tied to a terminal event
pub struct LifecycleGuard;

impl LifecycleGuard {
    /// Keep `object` alive until its bus emits `event`
    ///
    /// Taking `&Arc<T>` means the object is provably alive while it is armed.
    pub fn arm<T>(object: &Arc<T>, event: &str) -> Result<ListenerId, EventError>
    where
        T: HasEventBus + Send + Sync + 'static,
    {
        if event.is_empty() {
            return Err(EventError::InvalidEventName);
        }
        let key = key_of(object);
        {
            let mut registry = registry();
            let entry = registry.entry(key).or_insert_with(|| Armed {
                object: object.clone(),
                events: Vec::new(),
            });
            entry.events.push(event.to_string());
        }

        let teardown = format!("{event}{SELF_DESTRUCT_SUFFIX}");
        let armed_event = event.to_string();
        let released = armed_event.clone();
        let result = object
            .event_bus()
            .once(&teardown, Callback::any(move |_| Self::release(key, &released)));

        match result {
            Ok(id) => {
                debug!(key, event = %armed_event, %id, "LifecycleGuard::arm: armed");
                Ok(id)
            }
            Err(e) => {
                Self::release(key, &armed_event);
                Err(e)
            }
        }
    }

    fn release(key: usize, event: &str) {
        let dropped = {
            let mut registry = registry();
            let Some(entry) = registry.get_mut(&key) else {
                return;
            };
            if let Some(pos) = entry.events.iter().position(|e| e == event) {
                entry.events.remove(pos);
            }
            if entry.events.is_empty() {
                registry.remove(&key).map(|armed| armed.object)
            } else {
                None
            }
        };
        debug!(key, %event, released = dropped.is_some(), "LifecycleGuard::release");
        // The object may run its own teardown on drop; never under the lock
        drop(dropped);
    }

    /// Whether `object` currently has a registry entry
    pub fn is_armed<T>(object: &Arc<T>) -> bool {
        registry().contains_key(&key_of(object))
    }

    /// Events `object` is still armed for
    pub fn pending_events<T>(object: &Arc<T>) -> Vec<String> {
        registry()
            .get(&key_of(object))
            .map(|armed| armed.events.clone())
            .unwrap_or_default()
    }

    /// Number of objects currently kept alive by the registry
    pub fn armed_count() -> usize {
        registry().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventArgs, EventBus};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        bus: EventBus,
        drops: Arc<AtomicUsize>,
    }

    impl HasEventBus for Tracked {
        fn event_bus(&self) -> &EventBus {
            &self.bus
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (Arc<Tracked>, EventBus, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::new();
        let object = Arc::new(Tracked {
            bus: bus.clone(),
            drops: drops.clone(),
        });
        (object, bus, drops)
    }

    #[test]
    #[serial]
    fn test_armed_object_survives_until_event() {
        let (object, bus, drops) = tracked();
        LifecycleGuard::arm(&object, "close").unwrap();
        assert!(LifecycleGuard::is_armed(&object));
        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        bus.emit("other", EventArgs::None).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        bus.emit("close", EventArgs::None).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_external_holder_keeps_object_after_release() {
        let (object, bus, drops) = tracked();
        LifecycleGuard::arm(&object, "close").unwrap();
        bus.emit("close", EventArgs::None).unwrap();
        assert!(!LifecycleGuard::is_armed(&object));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_ordinary_listeners_run_before_release() {
        let (object, bus, drops) = tracked();
        let seen_alive = Arc::new(AtomicUsize::new(0));
        {
            let drops = drops.clone();
            let seen_alive = seen_alive.clone();
            bus.on(
                "close",
                Callback::unit(move || {
                    if drops.load(Ordering::SeqCst) == 0 {
                        seen_alive.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        }
        LifecycleGuard::arm(&object, "close").unwrap();
        drop(object);
        bus.emit("close", EventArgs::None).unwrap();
        assert_eq!(seen_alive.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_armed_for_two_events_has_one_entry() {
        let (object, bus, drops) = tracked();
        LifecycleGuard::arm(&object, "close").unwrap();
        LifecycleGuard::arm(&object, "exit").unwrap();
        assert_eq!(LifecycleGuard::pending_events(&object), vec!["close", "exit"]);
        assert!(LifecycleGuard::armed_count() >= 1);

        bus.emit("exit", EventArgs::None).unwrap();
        assert_eq!(LifecycleGuard::pending_events(&object), vec!["close"]);
        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        bus.emit("close", EventArgs::None).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_arm_rolls_back_when_listener_rejected() {
        let (object, bus, _drops) = tracked();
        bus.set_max_listeners(1);
        bus.on("close_selfdestruct", Callback::unit(|| {})).unwrap();
        let err = LifecycleGuard::arm(&object, "close").unwrap_err();
        assert!(matches!(err, EventError::ResourceExhausted { .. }));
        assert!(!LifecycleGuard::is_armed(&object));
    }

    #[test]
    #[serial]
    fn test_empty_event_rejected() {
        let (object, _bus, _drops) = tracked();
        assert_eq!(LifecycleGuard::arm(&object, ""), Err(EventError::InvalidEventName));
    }
}
