//! AsyncStream - event-driven TCP stream
//!
//! The handle is cheap to clone; every clone drives the same connection.
//! Socket work runs as tasks on the I/O thread:
//!
//! - a connect task that attaches the socket and emits `connect`
//! - a read loop that frames incoming bytes and emits `data_received`
//! - a write loop that drains queued writes in order and emits
//!   `write_completion` / `all_writes_completed`
//!
//! Transport failures never surface from these calls; they are emitted on
//! `error` with a `where` field naming the operation. The synchronous calls
//! only fail for usage errors such as writing to a closed stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use evio_sync::Semaphore;
use regex::bytes::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::framing::{FrameRule, Predicate, ReadFramer, ReadMode};
use super::{Readable, StreamError, Writable};
use crate::config::{Config, StreamConfig};
use crate::context::IoHandle;
use crate::error_value::ErrorValue;
use crate::events::{
    ALL_WRITES_COMPLETED, CLOSED, CONNECT, DATA_RECEIVED, EventArgs, EventBus, HasEventBus, LifecycleGuard, ListenerId,
    SELF_DESTRUCT_SUFFIX, StandardEvents, StreamEvents, WRITE_COMPLETION,
};

/// Output side lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Open,
    Ended,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug)]
enum WriteOp {
    Data(Bytes),
    Shutdown,
}

struct StreamState {
    phase: Phase,
    connection: Connection,
    mode: ReadMode,
    delimiter: Bytes,
    pattern: Option<Regex>,
    predicate: Option<Predicate>,
    /// Bytes read but not yet delivered; frames are cut at delivery time
    framer: ReadFramer,
    /// End-of-stream seen but the final `data_received` not yet emitted
    eof_pending: bool,
    bytes_read: u64,
    bytes_written: u64,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    reader: Option<OwnedReadHalf>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
    reading: bool,
}

impl StreamState {
    fn new(config: &StreamConfig) -> Self {
        let delimiter = if config.delimiter.is_empty() {
            Bytes::from_static(b"\n")
        } else {
            Bytes::copy_from_slice(config.delimiter.as_bytes())
        };
        Self {
            phase: Phase::Open,
            connection: Connection::Idle,
            mode: ReadMode::Delimiter,
            delimiter,
            pattern: None,
            predicate: None,
            framer: ReadFramer::new(),
            eof_pending: false,
            bytes_read: 0,
            bytes_written: 0,
            local: None,
            remote: None,
            reader: None,
            writer: None,
            reading: false,
        }
    }

    /// Boundary rule for the next frame
    fn frame_rule(&self, buffer_size: usize) -> FrameRule {
        match (self.mode, &self.pattern, &self.predicate) {
            (ReadMode::DoubleDelimiter, _, _) => FrameRule::DoubleDelimiter(self.delimiter.clone()),
            (ReadMode::Pattern, Some(re), _) => FrameRule::Pattern(re.clone()),
            (ReadMode::Predicate, _, Some(pred)) => FrameRule::Predicate(pred.clone()),
            (ReadMode::FillBuffer, _, _) => FrameRule::FillBuffer(buffer_size),
            _ => FrameRule::Delimiter(self.delimiter.clone()),
        }
    }
}

struct StreamInner {
    bus: EventBus,
    io: IoHandle,
    config: StreamConfig,
    state: Mutex<StreamState>,
    cancel: watch::Sender<bool>,
    pending: Semaphore,
}

impl HasEventBus for StreamInner {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: &str, args: EventArgs) {
        if let Err(e) = self.bus.emit(event, args) {
            warn!(%event, error = %e, "AsyncStream: emit failed");
        }
    }

    fn report(&self, error: ErrorValue, location: &str) {
        debug!(%location, error = %error.description(), "AsyncStream: transport error");
        if let Err(e) = self.emit_error(error, location) {
            warn!(%location, error = %e, "AsyncStream: emit error failed");
        }
    }

    /// Take ownership of a connected socket; false if the stream closed first
    fn attach(self: &Arc<Self>, tcp: TcpStream) -> bool {
        let local = tcp.local_addr().ok();
        let remote = tcp.peer_addr().ok();
        let (reader, writer) = tcp.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                debug!(?remote, "AsyncStream::attach: stream closed before attach");
                return false;
            }
            state.local = local;
            state.remote = remote;
            state.reader = Some(reader);
            state.writer = Some(tx);
            state.connection = Connection::Connected;
        }
        debug!(?local, ?remote, "AsyncStream::attach: connected");
        self.io.spawn(write_loop(Arc::downgrade(self), writer, rx));
        true
    }

    fn on_chunk(&self, data: &[u8]) {
        {
            let mut state = self.lock();
            state.bytes_read += data.len() as u64;
            state.framer.push(data);
            trace!(len = data.len(), buffered = state.framer.buffered(), "AsyncStream::on_chunk");
        }
        self.deliver();
    }

    fn on_eof(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            debug!(buffered = state.framer.buffered(), "AsyncStream::on_eof");
            state.eof_pending = true;
        }
        self.deliver();
        if self.config.close_on_eof {
            self.close(true);
        }
    }

    /// Cut the next frame under the current read mode
    fn next_frame(&self) -> Option<(Bytes, bool)> {
        let mut state = self.lock();
        let rule = state.frame_rule(self.config.read_buffer_size);
        if let Some(frame) = state.framer.next_frame(&rule) {
            return Some((frame, false));
        }
        if state.eof_pending {
            state.eof_pending = false;
            return Some((state.framer.finish(), true));
        }
        None
    }

    /// Hand buffered frames to `data_received` listeners, oldest first
    ///
    /// The mode is read again before every frame, so a listener that
    /// switches modes changes how the rest of the buffer is cut.
    fn deliver(&self) {
        while self.bus.listener_count(DATA_RECEIVED) > 0 {
            let Some((bytes, eof)) = self.next_frame() else {
                break;
            };
            self.emit(DATA_RECEIVED, EventArgs::Data { bytes, eof });
        }
    }

    /// Re-frame buffered bytes after a read mode change
    fn reframe(self: &Arc<Self>) {
        let inner = self.clone();
        self.io.post(move || inner.deliver());
    }

    fn on_write_done(&self, len: usize, result: std::io::Result<()>) {
        match result {
            Ok(()) => {
                self.lock().bytes_written += len as u64;
                self.emit(WRITE_COMPLETION, EventArgs::None);
            }
            Err(e) => self.report(ErrorValue::from_io_error(&e, "write"), "write"),
        }
        self.pending.try_wait();
        if self.pending.count() == 0 {
            self.emit(ALL_WRITES_COMPLETED, EventArgs::None);
        }
    }

    fn close(self: &Arc<Self>, emit_events: bool) {
        let (reader, writer) = {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                trace!("AsyncStream::close: already closed");
                return;
            }
            state.phase = Phase::Closed;
            (state.reader.take(), state.writer.take())
        };
        debug!(emit_events, "AsyncStream::close");
        self.cancel.send_replace(true);
        drop(reader);
        // Writes already queued still drain before the write half drops
        drop(writer);

        let inner = self.clone();
        self.io.post(move || {
            if emit_events {
                inner.emit(CLOSED, EventArgs::None);
            } else {
                // Lifecycle teardown still runs when ordinary listeners are skipped
                inner.emit(&format!("{CLOSED}{SELF_DESTRUCT_SUFFIX}"), EventArgs::None);
            }
        });
    }
}

async fn read_loop(inner: Arc<StreamInner>, mut reader: OwnedReadHalf) {
    let mut cancel = inner.cancel.subscribe();
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];
    debug!("AsyncStream::read_loop: started");
    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        let result = tokio::select! {
            result = reader.read(&mut buf) => result,
            _ = cancel.changed() => break,
        };
        match result {
            Ok(0) => {
                inner.on_eof();
                break;
            }
            Ok(n) => inner.on_chunk(&buf[..n]),
            Err(e) => {
                inner.report(ErrorValue::from_io_error(&e, "read"), "read");
                break;
            }
        }
    }
    inner.lock().reading = false;
    debug!("AsyncStream::read_loop: stopped");
}

/// Drains queued writes in order; holds only a weak reference so an
/// abandoned stream can still be dropped
async fn write_loop(inner: Weak<StreamInner>, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                let result = writer.write_all(&bytes).await;
                if let Some(inner) = inner.upgrade() {
                    inner.on_write_done(bytes.len(), result);
                }
            }
            WriteOp::Shutdown => {
                if let Err(e) = writer.shutdown().await
                    && let Some(inner) = inner.upgrade()
                {
                    inner.report(ErrorValue::from_io_error(&e, "shutdown"), "shutdown");
                }
            }
        }
    }
    debug!("AsyncStream::write_loop: stopped");
}

/// Event-driven TCP stream
#[derive(Clone)]
pub struct AsyncStream {
    inner: Arc<StreamInner>,
}

impl AsyncStream {
    /// Create an unconnected stream bound to an I/O thread
    pub fn new(io: IoHandle, config: &Config) -> Self {
        debug!(read_buffer_size = config.stream.read_buffer_size, "AsyncStream::new: called");
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                bus: EventBus::from_config(&config.events),
                io,
                config: config.stream.clone(),
                state: Mutex::new(StreamState::new(&config.stream)),
                cancel,
                pending: Semaphore::new(0),
            }),
        }
    }

    /// Adopt a socket that is already connected
    ///
    /// The socket must belong to the I/O thread's runtime.
    pub fn from_tcp(io: IoHandle, config: &Config, tcp: TcpStream) -> Self {
        let stream = Self::new(io, config);
        stream.inner.lock().connection = Connection::Connecting;
        stream.inner.attach(tcp);
        stream
    }

    /// Start connecting; emits `connect` or `error` (`where = "connect"`)
    pub fn connect(&self, host: &str, port: u16) -> Result<(), StreamError> {
        debug!(%host, port, "AsyncStream::connect: called");
        {
            let mut state = self.inner.lock();
            if state.phase == Phase::Closed {
                return Err(StreamError::Closed);
            }
            if state.connection != Connection::Idle {
                return Err(StreamError::AlreadyConnected);
            }
            state.connection = Connection::Connecting;
        }

        let inner = self.inner.clone();
        let host = host.to_string();
        self.inner.io.spawn(async move {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(tcp) => {
                    if inner.attach(tcp) {
                        inner.emit(CONNECT, EventArgs::None);
                    }
                }
                Err(e) => {
                    {
                        let mut state = inner.lock();
                        if state.connection == Connection::Connecting {
                            state.connection = Connection::Idle;
                        }
                    }
                    let error = ErrorValue::from_io_error(&e, "connect")
                        .with("host", host)
                        .with("port", port.to_string());
                    inner.report(error, "connect");
                }
            }
        });
        Ok(())
    }

    /// Start the read loop; a second call only flushes queued frames
    pub fn read_async(&self) -> Result<(), StreamError> {
        let reader = {
            let mut state = self.inner.lock();
            if state.phase == Phase::Closed {
                return Err(StreamError::Closed);
            }
            if state.connection != Connection::Connected {
                return Err(StreamError::NotConnected);
            }
            if state.reading {
                None
            } else {
                state.reading = state.reader.is_some();
                state.reader.take()
            }
        };
        debug!(starting = reader.is_some(), "AsyncStream::read_async: called");

        // Bytes buffered before a listener existed go out first
        self.inner.reframe();
        if let Some(reader) = reader {
            self.inner.io.spawn(read_loop(self.inner.clone(), reader));
        }
        Ok(())
    }

    /// Queue bytes for writing; emits `write_completion` when written
    pub fn write_async(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        let data = data.into();
        let state = self.inner.lock();
        match state.phase {
            Phase::Closed => return Err(StreamError::Closed),
            Phase::Ended => return Err(StreamError::Ended),
            Phase::Open => {}
        }
        let Some(tx) = state.writer.as_ref() else {
            return Err(StreamError::NotConnected);
        };
        trace!(len = data.len(), "AsyncStream::write_async");
        self.inner.pending.notify();
        if tx.send(WriteOp::Data(data)).is_err() {
            self.inner.pending.try_wait();
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Write any final bytes, then half-close the output
    pub fn end(&self, data: Option<Bytes>) -> Result<(), StreamError> {
        debug!(has_data = data.is_some(), "AsyncStream::end: called");
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            self.write_async(data)?;
        }
        let mut state = self.inner.lock();
        match state.phase {
            Phase::Closed => return Err(StreamError::Closed),
            Phase::Ended => return Err(StreamError::Ended),
            Phase::Open => {}
        }
        let Some(tx) = state.writer.as_ref() else {
            return Err(StreamError::NotConnected);
        };
        if tx.send(WriteOp::Shutdown).is_err() {
            return Err(StreamError::Closed);
        }
        state.phase = Phase::Ended;
        Ok(())
    }

    /// Close both directions; emits `closed` once when `emit_events` is set
    ///
    /// Safe to call any number of times.
    pub fn close(&self, emit_events: bool) {
        self.inner.close(emit_events);
    }

    /// Close without emitting `closed`
    pub fn cancel(&self) {
        self.inner.close(false);
    }

    pub fn set_read_mode(&self, mode: ReadMode) -> Result<(), StreamError> {
        let mut state = self.inner.lock();
        match mode {
            ReadMode::Pattern if state.pattern.is_none() => return Err(StreamError::MissingPattern),
            ReadMode::Predicate if state.predicate.is_none() => return Err(StreamError::MissingPredicate),
            _ => {}
        }
        debug!(?mode, "AsyncStream::set_read_mode");
        state.mode = mode;
        drop(state);
        self.inner.reframe();
        Ok(())
    }

    /// Set the delimiter, or a regular expression when `is_pattern` is true
    ///
    /// A pattern also switches to pattern mode. A delimiter keeps a
    /// delimiter-based mode and otherwise switches to delimiter mode.
    pub fn set_read_until(&self, value: &str, is_pattern: bool) -> Result<(), StreamError> {
        if is_pattern {
            let re = Regex::new(value)?;
            let mut state = self.inner.lock();
            state.pattern = Some(re);
            state.mode = ReadMode::Pattern;
        } else {
            if value.is_empty() {
                return Err(StreamError::EmptyDelimiter);
            }
            let mut state = self.inner.lock();
            state.delimiter = Bytes::copy_from_slice(value.as_bytes());
            if !matches!(state.mode, ReadMode::Delimiter | ReadMode::DoubleDelimiter) {
                state.mode = ReadMode::Delimiter;
            }
        }
        debug!(%value, is_pattern, "AsyncStream::set_read_until");
        self.inner.reframe();
        Ok(())
    }

    /// Install a frame predicate and switch to predicate mode
    pub fn set_read_predicate(&self, predicate: Predicate) {
        {
            let mut state = self.inner.lock();
            state.predicate = Some(predicate);
            state.mode = ReadMode::Predicate;
        }
        self.inner.reframe();
    }

    /// Drop the predicate; predicate mode falls back to delimiter mode
    pub fn clear_read_predicate(&self) {
        let mut state = self.inner.lock();
        state.predicate = None;
        if state.mode == ReadMode::Predicate {
            state.mode = ReadMode::Delimiter;
        }
        drop(state);
        self.inner.reframe();
    }

    pub fn read_mode(&self) -> ReadMode {
        self.inner.lock().mode
    }

    pub fn delimiter(&self) -> Bytes {
        self.inner.lock().delimiter.clone()
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.lock().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Writes issued but not yet completed
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.count()
    }

    /// Bytes read but not yet delivered on `data_received`
    pub fn undelivered_bytes(&self) -> usize {
        self.inner.lock().framer.buffered()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().remote
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connection == Connection::Connected
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().phase >= Phase::Ended
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().phase == Phase::Closed
    }

    /// Block until every issued write completed, or `timeout` passes
    ///
    /// Must not be called on the I/O thread.
    pub fn wait_for_writes(&self, timeout: Duration) -> bool {
        self.inner.pending.wait_until_zero_for(timeout)
    }

    /// Keep this stream alive until it emits `event`
    pub fn arm(&self, event: &str) -> Result<ListenerId, StreamError> {
        Ok(LifecycleGuard::arm(&self.inner, event)?)
    }

    /// Whether the lifecycle registry is holding this stream
    pub fn is_armed(&self) -> bool {
        LifecycleGuard::is_armed(&self.inner)
    }

    /// Whether two handles drive the same stream
    pub fn ptr_eq(&self, other: &AsyncStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl HasEventBus for AsyncStream {
    fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

impl StreamEvents for AsyncStream {}

impl Readable for AsyncStream {
    fn read_async(&self) -> Result<(), StreamError> {
        AsyncStream::read_async(self)
    }

    fn set_read_mode(&self, mode: ReadMode) -> Result<(), StreamError> {
        AsyncStream::set_read_mode(self, mode)
    }

    fn set_read_until(&self, value: &str, is_pattern: bool) -> Result<(), StreamError> {
        AsyncStream::set_read_until(self, value, is_pattern)
    }

    fn set_read_predicate(&self, predicate: Predicate) {
        AsyncStream::set_read_predicate(self, predicate)
    }

    fn clear_read_predicate(&self) {
        AsyncStream::clear_read_predicate(self)
    }

    fn bytes_read(&self) -> u64 {
        AsyncStream::bytes_read(self)
    }
}

impl Writable for AsyncStream {
    fn write_async(&self, data: Bytes) -> Result<(), StreamError> {
        AsyncStream::write_async(self, data)
    }

    fn end(&self, data: Option<Bytes>) -> Result<(), StreamError> {
        AsyncStream::end(self, data)
    }

    fn bytes_written(&self) -> u64 {
        AsyncStream::bytes_written(self)
    }

    fn pending_writes(&self) -> usize {
        AsyncStream::pending_writes(self)
    }
}

impl fmt::Debug for AsyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AsyncStream")
            .field("phase", &state.phase)
            .field("connection", &state.connection)
            .field("mode", &state.mode)
            .field("remote", &state.remote)
            .field("bytes_read", &state.bytes_read)
            .field("bytes_written", &state.bytes_written)
            .finish()
    }
}
