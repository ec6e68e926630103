//! StreamServer - accept TCP connections as AsyncStreams
//!
//! Emits `listening` with the bound address, then `connection` for every
//! accepted socket. Each accepted stream is armed on `closed`, so it stays
//! alive after the `connection` listeners return until it closes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{AsyncStream, StreamError};
use crate::config::Config;
use crate::context::IoHandle;
use crate::error_value::ErrorValue;
use crate::events::{CLOSED, CONNECTION, Callback, EventArgs, EventBus, EventError, HasEventBus, LISTENING, ListenerId, StandardEvents};

#[derive(Debug, Default)]
struct ServerState {
    listening: bool,
    closed: bool,
    local: Option<SocketAddr>,
}

struct ServerInner {
    bus: EventBus,
    io: IoHandle,
    config: Config,
    state: Mutex<ServerState>,
    cancel: watch::Sender<bool>,
}

impl HasEventBus for ServerInner {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

impl ServerInner {
    fn emit(&self, event: &str, args: EventArgs) {
        if let Err(e) = self.bus.emit(event, args) {
            warn!(%event, error = %e, "StreamServer: emit failed");
        }
    }

    fn report(&self, error: ErrorValue, location: &str) {
        if let Err(e) = self.emit_error(error, location) {
            warn!(%location, error = %e, "StreamServer: emit error failed");
        }
    }

    fn accepted(&self, tcp: tokio::net::TcpStream, peer: SocketAddr) {
        debug!(%peer, "StreamServer: accepted connection");
        let stream = AsyncStream::from_tcp(self.io.clone(), &self.config, tcp);
        if let Err(e) = stream.arm(CLOSED) {
            warn!(%peer, error = %e, "StreamServer: failed to arm accepted stream");
        }
        self.emit(CONNECTION, EventArgs::value(stream));
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut cancel = inner.cancel.subscribe();
    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        let result = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.changed() => break,
        };
        match result {
            Ok((tcp, peer)) => inner.accepted(tcp, peer),
            // Per-connection failures (e.g. aborted handshakes) do not stop the server
            Err(e) => inner.report(ErrorValue::from_io_error(&e, "accept"), "accept"),
        }
    }
    debug!("StreamServer::accept_loop: stopped");
}

/// TCP listener that hands out accepted connections as streams
#[derive(Clone)]
pub struct StreamServer {
    inner: Arc<ServerInner>,
}

impl StreamServer {
    pub fn new(io: IoHandle, config: &Config) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                bus: EventBus::from_config(&config.events),
                io,
                config: config.clone(),
                state: Mutex::new(ServerState::default()),
                cancel,
            }),
        }
    }

    /// Bind and start accepting; emits `listening` or `error` (`where = "listen"`)
    pub fn listen(&self, host: &str, port: u16) -> Result<(), StreamError> {
        debug!(%host, port, "StreamServer::listen: called");
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(StreamError::Closed);
            }
            if state.listening {
                return Err(StreamError::AlreadyListening);
            }
            state.listening = true;
        }

        let inner = self.inner.clone();
        let host = host.to_string();
        self.inner.io.spawn(async move {
            match TcpListener::bind((host.as_str(), port)).await {
                Ok(listener) => {
                    let local = listener.local_addr().ok();
                    {
                        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                        if state.closed {
                            return;
                        }
                        state.local = local;
                    }
                    info!(?local, "StreamServer: listening");
                    if let Some(addr) = local {
                        inner.emit(LISTENING, EventArgs::Endpoint(addr));
                    }
                    accept_loop(inner, listener).await;
                }
                Err(e) => {
                    inner
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .listening = false;
                    let error = ErrorValue::from_io_error(&e, "listen")
                        .with("host", host)
                        .with("port", port.to_string());
                    inner.report(error, "listen");
                }
            }
        });
        Ok(())
    }

    /// Listen for accepted streams
    pub fn on_connection(&self, f: impl Fn(&AsyncStream) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.inner.bus.on(
            CONNECTION,
            Callback::value(move |value| {
                if let Some(stream) = value.downcast_ref::<AsyncStream>() {
                    f(stream);
                }
            }),
        )
    }

    pub fn on_listening(&self, f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Result<ListenerId, EventError> {
        self.inner.bus.on(LISTENING, Callback::endpoint(f))
    }

    /// Stop accepting; emits `closed` once
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
            state.listening = false;
        }
        debug!("StreamServer::close");
        self.inner.cancel.send_replace(true);
        let inner = self.inner.clone();
        self.inner.io.post(move || inner.emit(CLOSED, EventArgs::None));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).local
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}

impl HasEventBus for StreamServer {
    fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

impl fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServer")
            .field("local", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}
