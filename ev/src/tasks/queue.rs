//! TaskQueue - bounded worker pool with completions on the I/O thread
//!
//! Task bodies run on plain OS threads. Workers are spawned on demand up to
//! the configured bound and retire after sitting idle, so `wait` returns
//! once the queue has drained and every worker has gone away. A body's
//! outcome is turned into `Option<ErrorValue>` at the worker boundary and
//! the task's completion closure is posted to the I/O thread, exactly once.
//! Completions that reach the I/O thread after its context shut down are
//! dropped with a warning, so stop the queue before the context.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use evio_sync::{BlockingQueue, Semaphore};
use tracing::{debug, error, info, trace, warn};

use super::item::{Completion, TaskId, WorkItem};
use crate::config::Config;
use crate::context::IoHandle;
use crate::error_value::{ErrorValue, WHERE, panic_message};
use crate::events::{EventBus, HasEventBus, StandardEvents};

struct QueueInner {
    bus: EventBus,
    io: IoHandle,
    items: BlockingQueue<WorkItem>,
    /// Live worker count
    live: Semaphore,
    running: AtomicBool,
    max_workers: usize,
    idle_timeout: Duration,
    next_id: AtomicI64,
    next_worker: AtomicUsize,
}

impl HasEventBus for QueueInner {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

impl QueueInner {
    fn complete(&self, id: TaskId, completion: Option<Completion>, outcome: Option<ErrorValue>) {
        match completion {
            Some(completion) => {
                if !self.io.post(move || completion(id, outcome)) {
                    warn!(id, "TaskQueue: I/O thread gone, completion dropped");
                }
            }
            None => {
                if let Some(e) = outcome {
                    debug!(id, error = %e.description(), "TaskQueue: task failed without completion");
                }
            }
        }
    }

    /// Post a framework failure to the queue's `error` event
    fn report(self: &Arc<Self>, error: ErrorValue, location: &'static str) {
        error!(%location, error = %error.description(), "TaskQueue: framework error");
        let inner = self.clone();
        self.io.post(move || {
            if let Err(e) = inner.emit_error(error, location) {
                warn!(error = %e, "TaskQueue: emit error failed");
            }
        });
    }
}

/// Decrements the live count when a worker leaves, unless the idle
/// retirement already did
struct LiveGuard<'a> {
    live: &'a Semaphore,
    armed: bool,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.live.try_wait();
        }
    }
}

fn worker_loop(inner: &QueueInner, index: usize) {
    let mut guard = LiveGuard {
        live: &inner.live,
        armed: true,
    };
    debug!(index, "TaskQueue::worker: started");
    loop {
        if !inner.running.load(Ordering::SeqCst) {
            debug!(index, "TaskQueue::worker: running flag cleared");
            break;
        }
        // Retiring under the queue lock means a concurrent push either lands
        // before we give up or sees our slot free and spawns a new worker
        let item = inner.items.pop_or_else(inner.idle_timeout, || {
            inner.live.try_wait();
            guard.armed = false;
        });
        let Some(item) = item else {
            debug!(index, "TaskQueue::worker: idle, retiring");
            break;
        };
        trace!(index, id = item.id(), "TaskQueue::worker: executing");
        let (id, completion, outcome) = item.execute();
        inner.complete(id, completion, outcome);
    }
}

/// Background work queue
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(io: IoHandle, config: &Config) -> Self {
        let max_workers = config.work_queue.effective_max_workers();
        debug!(max_workers, "TaskQueue::new: called");
        Self {
            inner: Arc::new(QueueInner {
                bus: EventBus::from_config(&config.events),
                io,
                items: BlockingQueue::new(),
                live: Semaphore::new(0),
                running: AtomicBool::new(false),
                max_workers,
                idle_timeout: config.work_queue.idle_timeout(),
                next_id: AtomicI64::new(1),
                next_worker: AtomicUsize::new(1),
            }),
        }
    }

    /// Queue a task and return its id
    ///
    /// `on_completion` runs on the I/O thread with `None` on success or the
    /// task's error. With `auto_start` the pool is started if needed.
    pub fn add_work_item<F>(&self, body: F, on_completion: Option<Completion>, auto_start: bool) -> TaskId
    where
        F: FnOnce() -> Result<(), ErrorValue> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        trace!(id, auto_start, "TaskQueue::add_work_item");
        let item = WorkItem::new(id, Box::new(body), on_completion);
        if let Err(e) = self.inner.items.push(item) {
            let (id, completion, outcome) = e
                .into_inner()
                .abandon(ErrorValue::new("task could not be queued").with(WHERE, "task_queue#add"));
            self.inner.complete(id, completion, outcome);
            return id;
        }
        if auto_start {
            self.run();
        }
        id
    }

    /// Start workers for the queued items, up to the worker bound
    ///
    /// Calling it again while workers are live only tops the pool up.
    pub fn run(&self) {
        self.inner.items.reset();
        self.inner.running.store(true, Ordering::SeqCst);

        let wanted = self.inner.items.len();
        let mut spawned = 0;
        while spawned < wanted && self.inner.live.notify_below(self.inner.max_workers) {
            let index = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
            let inner = self.inner.clone();
            let result = thread::Builder::new()
                .name(format!("evio-worker-{index}"))
                .spawn(move || {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| worker_loop(&inner, index))) {
                        let message = panic_message(payload.as_ref());
                        inner.report(ErrorValue::new(format!("worker panicked: {message}")), "worker#loop");
                    }
                });
            match result {
                Ok(_) => spawned += 1,
                Err(e) => {
                    self.inner.live.try_wait();
                    self.inner
                        .report(ErrorValue::from_io_error(&e, "task_queue#run"), "task_queue#run");
                    break;
                }
            }
        }
        debug!(
            spawned,
            live = self.inner.live.count(),
            queued = self.inner.items.len(),
            "TaskQueue::run"
        );
    }

    fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.items.interrupt();
        let leftovers = self.inner.items.drain();
        info!(abandoned = leftovers.len(), "TaskQueue::stop");
        for item in leftovers {
            let error = ErrorValue::new("task queue stopped before the task ran").with(WHERE, "task_queue#stop");
            let (id, completion, outcome) = item.abandon(error);
            self.inner.complete(id, completion, outcome);
        }
    }

    fn announce_exit(&self) {
        let inner = self.inner.clone();
        self.inner.io.post(move || {
            if let Err(e) = inner.emit_exit(None) {
                warn!(error = %e, "TaskQueue: emit exit failed");
            }
        });
    }

    /// Stop the pool; queued tasks that never started complete with an error
    ///
    /// Tasks already running finish. With `wait` the call blocks until every
    /// worker has exited.
    pub fn stop(&self, wait: bool) {
        self.shutdown();
        if wait {
            self.wait();
        }
        self.announce_exit();
    }

    /// Stop and wait at most `timeout` for the workers; true if they all exited
    pub fn stop_for(&self, timeout: Duration) -> bool {
        self.shutdown();
        let done = self.wait_for(timeout);
        self.announce_exit();
        done
    }

    /// Block until no worker is live
    pub fn wait(&self) {
        self.inner.live.wait_until_zero();
    }

    /// Block at most `timeout` for the live worker count to reach zero
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.inner.live.wait_until_zero_for(timeout)
    }

    pub fn max_concurrency(&self) -> i64 {
        i64::try_from(self.inner.max_workers).unwrap_or(i64::MAX)
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live.count()
    }

    /// Tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl HasEventBus for TaskQueue {
    fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("max_workers", &self.inner.max_workers)
            .field("live", &self.inner.live.count())
            .field("queued", &self.inner.items.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::sync::{Barrier, Mutex};

    const WAIT: Duration = Duration::from_secs(5);

    type Outcome = (TaskId, Option<(String, Option<String>)>);

    fn queue_with(max_workers: usize) -> (IoContext, TaskQueue) {
        let io = IoContext::start("evio-test-io").unwrap();
        let mut config = Config::default();
        config.work_queue.max_workers = max_workers;
        config.work_queue.idle_timeout_ms = 20;
        let queue = TaskQueue::new(io.handle(), &config);
        (io, queue)
    }

    fn reporter(tx: &mpsc::Sender<Outcome>) -> Option<Completion> {
        let tx = tx.clone();
        Some(Box::new(move |id: TaskId, error: Option<ErrorValue>| {
            let summary = error.map(|e| (e.description().to_string(), e.location().map(str::to_string)));
            let _ = tx.send((id, summary));
        }))
    }

    #[test]
    fn test_completion_exactly_once() {
        let (_io, queue) = queue_with(4);
        let (tx, rx) = mpsc::channel();
        let mut expected = HashMap::new();
        for i in 0..30 {
            let id = match i % 3 {
                0 => queue.add_work_item(|| Ok(()), reporter(&tx), true),
                1 => queue.add_work_item(|| Err(ErrorValue::new("failed")), reporter(&tx), true),
                _ => queue.add_work_item(
                    || {
                        panic!("task blew up");
                    },
                    reporter(&tx),
                    true,
                ),
            };
            expected.insert(id, i % 3);
        }

        let mut seen: HashMap<TaskId, Option<(String, Option<String>)>> = HashMap::new();
        for _ in 0..30 {
            let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
            assert!(seen.insert(id, outcome).is_none(), "task {id} completed twice");
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        for (id, kind) in expected {
            let outcome = &seen[&id];
            match kind {
                0 => assert!(outcome.is_none()),
                1 => assert_eq!(outcome.as_ref().unwrap(), &("failed".to_string(), Some("worker#execute".to_string()))),
                _ => {
                    let (description, location) = outcome.as_ref().unwrap();
                    assert!(description.contains("task blew up"));
                    assert_eq!(location.as_deref(), Some("worker#execute"));
                }
            }
        }
    }

    #[test]
    fn test_task_ids_increase() {
        let (_io, queue) = queue_with(1);
        let a = queue.add_work_item(|| Ok(()), None, false);
        let b = queue.add_work_item(|| Ok(()), None, false);
        assert!(b > a);
        queue.stop(true);
    }

    #[test]
    fn test_completions_run_on_io_thread() {
        let (_io, queue) = queue_with(2);
        let (tx, rx) = mpsc::channel();
        queue.add_work_item(
            || Ok(()),
            Some(Box::new(move |_: TaskId, _: Option<ErrorValue>| {
                let _ = tx.send(thread::current().name().map(str::to_string));
            })),
            true,
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("evio-test-io"));
    }

    #[test]
    fn test_wait_returns_after_queued_work() {
        let (_io, queue) = queue_with(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            queue.add_work_item(
                move || {
                    thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                None,
                true,
            );
        }
        queue.wait();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.live_workers(), 0);
    }

    #[test]
    fn test_worker_bound_is_respected() {
        let (_io, queue) = queue_with(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..12 {
            let active = active.clone();
            let peak = peak.clone();
            queue.add_work_item(
                move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                None,
                true,
            );
            assert!(queue.live_workers() <= 2);
        }
        queue.wait();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.max_concurrency(), 2);
    }

    #[test]
    fn test_auto_start_false_waits_for_run() {
        let (_io, queue) = queue_with(1);
        let (tx, rx) = mpsc::channel();
        queue.add_work_item(|| Ok(()), reporter(&tx), false);
        assert_eq!(queue.live_workers(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(queue.queued(), 1);

        queue.run();
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_stop_hands_back_unstarted_items() {
        let (_io, queue) = queue_with(1);
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new(Barrier::new(2));
        let started = Arc::new(Barrier::new(2));
        {
            let gate = gate.clone();
            let started = started.clone();
            queue.add_work_item(
                move || {
                    started.wait();
                    gate.wait();
                    Ok(())
                },
                reporter(&tx),
                true,
            );
        }
        started.wait();
        let pending: Vec<TaskId> = (0..3).map(|_| queue.add_work_item(|| Ok(()), reporter(&tx), true)).collect();

        queue.stop(false);
        assert!(!queue.is_running());
        assert!(!queue.wait_for(Duration::from_millis(20)));
        gate.wait();
        queue.wait();

        let mut outcomes: Vec<Outcome> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        outcomes.sort_by_key(|(id, _)| *id);
        assert!(outcomes[0].1.is_none());
        for (outcome, id) in outcomes[1..].iter().zip(&pending) {
            assert_eq!(outcome.0, *id);
            let (_, location) = outcome.1.as_ref().unwrap();
            assert_eq!(location.as_deref(), Some("task_queue#stop"));
        }
    }

    #[test]
    fn test_stop_emits_exit() {
        let (_io, queue) = queue_with(1);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        queue
            .on_exit(move |error| {
                let _ = tx.lock().unwrap().send(error.is_none());
            })
            .unwrap();
        queue.add_work_item(|| Ok(()), None, true);
        assert!(queue.stop_for(WAIT));
        assert!(rx.recv_timeout(WAIT).unwrap());
    }

    #[test]
    fn test_framework_errors_reach_error_event() {
        let (_io, queue) = queue_with(1);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        queue
            .on_error(move |e| {
                let summary = (e.description().to_string(), e.location().map(str::to_string));
                let _ = tx.lock().unwrap().send(summary);
            })
            .unwrap();

        queue.inner.report(ErrorValue::new("worker panicked: boom"), "worker#loop");
        let (description, location) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(description, "worker panicked: boom");
        assert_eq!(location.as_deref(), Some("worker#loop"));

        let spawn_failure = std::io::Error::other("no threads left");
        queue
            .inner
            .report(ErrorValue::from_io_error(&spawn_failure, "task_queue#run"), "task_queue#run");
        let (_, location) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(location.as_deref(), Some("task_queue#run"));
    }

    #[test]
    fn test_completion_after_context_shutdown_is_dropped() {
        let (mut io, queue) = queue_with(1);
        io.shutdown();
        let (tx, rx) = mpsc::channel();
        queue.add_work_item(|| Ok(()), reporter(&tx), true);
        queue.wait();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(queue.live_workers(), 0);
    }

    #[test]
    fn test_run_after_stop_processes_again() {
        let (_io, queue) = queue_with(2);
        queue.stop(true);
        let (tx, rx) = mpsc::channel();
        queue.add_work_item(|| Ok(()), reporter(&tx), true);
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert!(outcome.is_none());
        assert!(queue.is_running());
    }
}
