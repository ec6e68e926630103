//! IoContext - the single I/O thread
//!
//! All event emission and all stream state changes happen on one thread per
//! context. `IoContext::start` owns that thread and runs a current-thread
//! tokio runtime on it; `IoContext::from_current` adopts the runtime the
//! caller is already inside, which is what `#[tokio::test]` code uses.
//!
//! Other threads reach the I/O thread only through an [`IoHandle`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, info, warn};

/// Errors from creating an I/O context
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to build I/O runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("failed to spawn I/O thread: {0}")]
    Spawn(String),

    #[error("no tokio runtime is running on this thread")]
    NoRuntime,
}

/// A posted closure; warns if the runtime drops it unrun
struct Posted<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Posted<F> {
    fn run(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl<F: FnOnce()> Drop for Posted<F> {
    fn drop(&mut self) {
        if self.f.is_some() {
            warn!("IoHandle: I/O thread shut down before posted work ran");
        }
    }
}

/// Cloneable handle used to marshal work onto the I/O thread
#[derive(Debug, Clone)]
pub struct IoHandle {
    runtime: Handle,
    thread: Option<ThreadId>,
    /// Cleared once the owning context shuts down
    open: Arc<AtomicBool>,
}

impl IoHandle {
    /// Run a closure on the I/O thread
    ///
    /// Returns false, dropping the closure, once the context has shut down.
    /// Work still queued when the I/O thread stops is dropped with a warning.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("IoHandle::post: I/O thread already shut down, dropping work");
            return false;
        }
        let posted = Posted { f: Some(f) };
        self.runtime.spawn(async move { posted.run() });
        true
    }

    /// Whether the owning context has shut down
    pub fn is_shut_down(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }

    /// Run a future on the I/O thread
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Whether the caller is on the dedicated I/O thread
    ///
    /// Always false for a handle adopted from an ambient runtime.
    pub fn is_io_thread(&self) -> bool {
        self.thread == Some(thread::current().id())
    }
}

/// Owner of the I/O thread
pub struct IoContext {
    handle: IoHandle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoContext {
    /// Spawn a dedicated I/O thread running a current-thread runtime
    pub fn start(name: &str) -> Result<Self, ContextError> {
        debug!(%name, "IoContext::start: called");
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("IoContext: I/O thread exiting");
            })
            .map_err(|e| ContextError::Spawn(e.to_string()))?;

        let runtime = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(ContextError::Runtime(e)),
            Err(_) => return Err(ContextError::Spawn("I/O thread exited during startup".to_string())),
        };
        let thread_id = thread.thread().id();
        info!(%name, "IoContext::start: I/O thread running");

        Ok(Self {
            handle: IoHandle {
                runtime,
                thread: Some(thread_id),
                open: Arc::new(AtomicBool::new(true)),
            },
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Adopt the tokio runtime the caller is running inside
    pub fn from_current() -> Result<Self, ContextError> {
        let runtime = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        debug!("IoContext::from_current: adopted ambient runtime");
        Ok(Self {
            handle: IoHandle {
                runtime,
                thread: None,
                open: Arc::new(AtomicBool::new(true)),
            },
            shutdown: None,
            thread: None,
        })
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Stop the I/O thread and wait for it to exit
    ///
    /// Tasks still pending on the I/O thread are dropped. A no-op for an
    /// adopted runtime.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            self.handle.open.store(false, Ordering::SeqCst);
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                warn!("IoContext::shutdown: called on the I/O thread, not joining");
                return;
            }
            if thread.join().is_err() {
                warn!("IoContext::shutdown: I/O thread panicked");
            }
            debug!("IoContext::shutdown: I/O thread joined");
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_post_runs_on_io_thread() {
        let context = IoContext::start("evio-test-io").unwrap();
        let handle = context.handle();
        let (tx, rx) = std_mpsc::channel();
        let check = handle.clone();
        handle.post(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send((name, check.is_io_thread())).unwrap();
        });
        let (name, on_io) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("evio-test-io"));
        assert!(on_io);
        assert!(!handle.is_io_thread());
    }

    #[test]
    fn test_posts_run_in_order() {
        let context = IoContext::start("evio-test-order").unwrap();
        let handle = context.handle();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            handle.post(move || tx.send(i).unwrap());
        }
        let got: Vec<i32> = (0..20).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut context = IoContext::start("evio-test-shutdown").unwrap();
        context.shutdown();
        context.shutdown();
    }

    #[test]
    fn test_post_after_shutdown_is_refused() {
        let mut context = IoContext::start("evio-test-late").unwrap();
        let handle = context.handle();
        assert!(!handle.is_shut_down());
        context.shutdown();
        assert!(handle.is_shut_down());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(!handle.post(move || flag.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_from_current_requires_runtime() {
        assert!(matches!(IoContext::from_current(), Err(ContextError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_from_current_spawns_on_ambient_runtime() {
        let context = IoContext::from_current().unwrap();
        let value = context.handle().spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
