//! Connection lifecycle.
//!
//! A [`Connection`] owns one socket and runs `2 + dispatchers` duties:
//!
//! ```text
//!   socket ──► receive ──► inbound queue ──► dispatch × N ──► NetworkCallback
//!   socket ◄── transmit ◄── outbound queue ◄── write / write_blocking
//! ```
//!
//! Every duty is wrapped in a fault barrier, and every duty that exits
//! triggers [`Connection::close`]. Teardown runs exactly once.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::callback::NetworkCallback;
use super::codec::{Codec, CodecReader, CodecWriter};
use super::frame::Frame;
use super::manager::SessionManager;
use super::sync::{WaitGroup, fault_barrier};
use crate::core::constants::{
    CLOSE_FLUSH_TIMEOUT, DEFAULT_CLIENT_DISPATCHERS, DEFAULT_CLIENT_QUEUE_SIZE,
    DEFAULT_SERVER_DISPATCHERS, DEFAULT_SERVER_QUEUE_SIZE, HEARTBEAT_INTERVAL, IDLE_READ_TIMEOUT,
};
use crate::core::{FrameError, TransportError, TransportResult};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Not started, or torn down.
    Closed = 0,
    /// Duties are being launched.
    Connecting = 1,
    /// Duties running, data transfer active.
    Established = 2,
    /// Listening socket.
    Listen = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Established,
            3 => Self::Listen,
            _ => Self::Closed,
        }
    }
}

/// How the socket came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Listening socket.
    Listen,
    /// Accepted by a server.
    Inbound,
    /// Dialed by a client.
    Outbound,
    /// Datagram socket.
    Datagram,
}

/// What a dispatch duty does when the message handler returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchErrorPolicy {
    /// Log the error and keep the connection open.
    #[default]
    Continue,
    /// Log the error and close the connection.
    Close,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection kind.
    pub kind: ConnKind,
    /// Capacity of the outbound and inbound queues.
    pub queue_size: usize,
    /// Number of dispatch duties (at least one is always started).
    pub dispatchers: usize,
    /// Heartbeat emission interval; `None` disables heartbeats.
    ///
    /// A connection that emits heartbeats does not echo the peer's.
    pub heartbeat: Option<Duration>,
    /// Close the connection when no frame arrives within this window.
    pub idle_timeout: Option<Duration>,
    /// Whether the owning client should redial after a disconnect.
    pub reconnect: bool,
    /// Handler error policy.
    pub dispatch_errors: DispatchErrorPolicy,
}

impl ConnectionConfig {
    /// Settings for server-accepted connections: in-order dispatch, idle deadline.
    pub fn server() -> Self {
        Self {
            kind: ConnKind::Inbound,
            queue_size: DEFAULT_SERVER_QUEUE_SIZE,
            dispatchers: DEFAULT_SERVER_DISPATCHERS,
            heartbeat: None,
            idle_timeout: Some(IDLE_READ_TIMEOUT),
            reconnect: false,
            dispatch_errors: DispatchErrorPolicy::Continue,
        }
    }

    /// Settings for client-initiated connections: parallel dispatch, heartbeats, reconnect.
    pub fn client() -> Self {
        Self {
            kind: ConnKind::Outbound,
            queue_size: DEFAULT_CLIENT_QUEUE_SIZE,
            dispatchers: DEFAULT_CLIENT_DISPATCHERS,
            heartbeat: Some(HEARTBEAT_INTERVAL),
            idle_timeout: None,
            reconnect: true,
            dispatch_errors: DispatchErrorPolicy::Continue,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::server()
    }
}

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    id: u64,
    codec: Codec,
    callback: Arc<dyn NetworkCallback>,
    name: String,
    address: Option<String>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Set the logical group name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the peer address string (defaults to the socket's peer address).
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the connection settings.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the connection. Duties are not started until [`Connection::start`].
    pub fn build(self) -> Arc<Connection> {
        let address = self
            .address
            .or_else(|| self.codec.peer_addr().map(|a| a.to_string()))
            .unwrap_or_default();

        let queue_size = self.config.queue_size.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_size);

        let (mut reader, writer) = self.codec.into_parts();
        reader.set_echo_heartbeats(self.config.heartbeat.is_none());

        Arc::new(Connection {
            id: self.id,
            name: self.name,
            address,
            kind: self.config.kind,
            state: AtomicU8::new(ConnState::Closed as u8),
            reconnect: AtomicBool::new(self.config.reconnect),
            config: self.config,
            manager: Mutex::new(Weak::new()),
            callback: self.callback,
            outbound: outbound_tx,
            writer,
            pending: Mutex::new(Some(PendingDuties {
                reader,
                outbound_rx,
                inbound_tx,
                inbound_rx,
            })),
            close_signal: CancellationToken::new(),
            closed: CancellationToken::new(),
            running: AtomicBool::new(true),
            duties: WaitGroup::new(),
            dropped: AtomicU64::new(0),
            extension: RwLock::new(None),
        })
    }
}

/// Resources handed to the duties on start.
struct PendingDuties {
    reader: CodecReader,
    outbound_rx: mpsc::Receiver<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: mpsc::Receiver<Frame>,
}

/// One physical transport endpoint.
pub struct Connection {
    id: u64,
    name: String,
    address: String,
    kind: ConnKind,
    state: AtomicU8,
    reconnect: AtomicBool,
    config: ConnectionConfig,

    /// Owning manager (back-reference only).
    manager: Mutex<Weak<SessionManager>>,
    callback: Arc<dyn NetworkCallback>,

    outbound: mpsc::Sender<Frame>,
    writer: CodecWriter,
    pending: Mutex<Option<PendingDuties>>,

    /// Cancelled when teardown begins; every duty watches it.
    close_signal: CancellationToken,
    /// Cancelled when teardown has finished.
    closed: CancellationToken,
    running: AtomicBool,
    duties: WaitGroup,

    dropped: AtomicU64,
    extension: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    /// Start building a connection with a pre-assigned identifier.
    pub fn builder(
        id: u64,
        codec: Codec,
        callback: Arc<dyn NetworkCallback>,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            id,
            codec,
            callback,
            name: String::new(),
            address: None,
            config: ConnectionConfig::default(),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical group name (empty for inbound connections).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Peer address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connection kind.
    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether teardown has not started yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the owning client should redial after a disconnect.
    pub fn reconnect(&self) -> bool {
        self.reconnect.load(Ordering::Acquire)
    }

    /// Enable or disable redial after a disconnect.
    pub fn set_reconnect(&self, reconnect: bool) {
        self.reconnect.store(reconnect, Ordering::Release);
    }

    /// Frames dropped because the outbound queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Owning session manager, if it is still alive.
    pub fn manager(&self) -> Option<Arc<SessionManager>> {
        self.manager.lock().upgrade()
    }

    pub(crate) fn set_manager(&self, manager: &Arc<SessionManager>) {
        *self.manager.lock() = Arc::downgrade(manager);
    }

    /// Attach application data to the connection, replacing any previous value.
    pub fn set_extension<T: Any + Send + Sync>(&self, value: T) {
        *self.extension.write() = Some(Arc::new(value));
    }

    /// Application data previously attached with [`Connection::set_extension`].
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let ext = self.extension.read().clone()?;
        ext.downcast::<T>().ok()
    }

    /// Launch the duties, then notify the callback.
    ///
    /// `on_connect` runs only after every duty has been spawned, so a callback
    /// that closes the connection immediately sees a fully initialised object.
    pub fn start(self: &Arc<Self>) -> TransportResult<()> {
        let parts = self
            .pending
            .lock()
            .take()
            .ok_or(TransportError::AlreadyStarted(self.id))?;
        if !self.is_running() {
            return Err(TransportError::ConnectionClosed(self.id));
        }

        let dispatchers = self.config.dispatchers.max(1);
        let duties = 2 + dispatchers;
        // Count every duty before any of them can finish, so teardown cannot
        // complete past this point without waiting for them.
        self.duties.add(duties);
        let entered = self.is_running()
            && self
                .state
                .compare_exchange(
                    ConnState::Closed as u8,
                    ConnState::Connecting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !entered {
            for _ in 0..duties {
                self.duties.done();
            }
            return Err(TransportError::ConnectionClosed(self.id));
        }

        self.spawn_duty(
            "receive",
            Arc::clone(self).receive_loop(parts.reader, parts.inbound_tx),
        );
        self.spawn_duty("transmit", Arc::clone(self).transmit_loop(parts.outbound_rx));

        let inbound = Arc::new(AsyncMutex::new(parts.inbound_rx));
        for _ in 0..dispatchers {
            self.spawn_duty(
                "dispatch",
                Arc::clone(self).dispatch_loop(Arc::clone(&inbound)),
            );
        }

        // A duty may already have failed; never resurrect a closed connection.
        let _ = self.state.compare_exchange(
            ConnState::Connecting as u8,
            ConnState::Established as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            conn_id = self.id,
            peer = %self.address,
            group = %self.name,
            dispatchers,
            "connection started"
        );

        // Skipped once teardown has begun; `on_disconnect` owns the callback then.
        if self.is_running() {
            self.callback.on_connect(self);
        }
        Ok(())
    }

    /// Queue a frame without waiting.
    ///
    /// When the outbound queue is full the frame is dropped, counted and
    /// `Ok(())` is still returned.
    pub fn write(&self, frame: Frame) -> TransportResult<()> {
        match self.try_write(frame) {
            Err(TransportError::QueueFull(_)) => Ok(()),
            other => other,
        }
    }

    /// Queue a frame without waiting, reporting a full queue as
    /// [`TransportError::QueueFull`]. The frame is dropped either way.
    pub fn try_write(&self, frame: Frame) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("wirepool_frames_dropped_total").increment(1);
                warn!(
                    conn_id = self.id,
                    peer = %self.address,
                    msg_type = frame.msg_type(),
                    dropped,
                    "outbound queue full, frame dropped"
                );
                Err(TransportError::QueueFull(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::ConnectionClosed(self.id)),
        }
    }

    /// Queue a frame, waiting for queue space.
    pub async fn write_blocking(&self, frame: Frame) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        tokio::select! {
            _ = self.close_signal.cancelled() => Err(TransportError::ConnectionClosed(self.id)),
            sent = self.outbound.send(frame) => {
                sent.map_err(|_| TransportError::ConnectionClosed(self.id))
            }
        }
    }

    /// Write a heartbeat straight to the socket, bypassing the outbound queue.
    pub async fn send_heartbeat(&self) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        self.writer.heartbeat().await?;
        Ok(())
    }

    /// Close the connection and wait for teardown to finish.
    ///
    /// Idempotent: the first caller runs teardown; concurrent and later
    /// callers wait for it to complete.
    pub async fn close(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.closed.cancelled().await;
            return;
        }
        debug!(conn_id = self.id, peer = %self.address, "closing connection");

        self.callback.on_disconnect(self);

        let manager = self.manager.lock().upgrade();
        if let Some(manager) = manager {
            manager.remove(self);
        }

        self.close_signal.cancel();
        // A never-started connection still owns its read half and queues.
        drop(self.pending.lock().take());

        self.duties.wait().await;

        // A peer that stopped reading must not stall teardown.
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = self.id, error = %e, "socket shutdown failed"),
            Err(_) => debug!(conn_id = self.id, "socket shutdown timed out"),
        }
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        self.closed.cancel();

        info!(conn_id = self.id, peer = %self.address, "connection closed");
    }

    /// Trigger [`Connection::close`] on a background task.
    ///
    /// For synchronous contexts such as message handlers.
    pub fn shutdown(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.close().await });
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn spawn_duty<F>(self: &Arc<Self>, duty: &'static str, body: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            fault_barrier(conn.id, duty, body).await;
            conn.duties.done();
            conn.close().await;
        });
    }

    async fn receive_loop(self: Arc<Self>, mut reader: CodecReader, inbound: mpsc::Sender<Frame>) {
        loop {
            let decoded = tokio::select! {
                _ = self.close_signal.cancelled() => break,
                decoded = self.read_frame(&mut reader) => decoded,
            };

            let frame = match decoded {
                Ok(Some(frame)) => frame,
                // Heartbeat, already answered.
                Ok(None) => continue,
                Err(e) if e.is_disconnect() => {
                    debug!(conn_id = self.id, peer = %self.address, "peer disconnected");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.id, peer = %self.address, error = %e, "receive failed");
                    break;
                }
            };

            tokio::select! {
                _ = self.close_signal.cancelled() => break,
                sent = inbound.send(frame) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn read_frame(&self, reader: &mut CodecReader) -> Result<Option<Frame>, FrameError> {
        let Some(idle) = self.config.idle_timeout else {
            return reader.decode().await;
        };
        match tokio::time::timeout(idle, reader.decode()).await {
            Ok(decoded) => decoded,
            Err(_) => Err(FrameError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "idle read deadline expired",
            ))),
        }
    }

    async fn transmit_loop(self: Arc<Self>, mut outbound: mpsc::Receiver<Frame>) {
        let mut heartbeat = self.config.heartbeat.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            // `None` means "emit a heartbeat".
            let next = tokio::select! {
                _ = self.close_signal.cancelled() => break,
                queued = outbound.recv() => match queued {
                    Some(frame) => Some(frame),
                    None => break,
                },
                _ = next_tick(&mut heartbeat) => None,
            };

            let written = tokio::select! {
                _ = self.close_signal.cancelled() => break,
                written = async {
                    match next {
                        Some(frame) => self.writer.encode(frame).await,
                        None => self.writer.heartbeat().await,
                    }
                } => written,
            };

            if let Err(e) = written {
                warn!(conn_id = self.id, peer = %self.address, error = %e, "transmit failed");
                break;
            }
        }
        outbound.close();
    }

    async fn dispatch_loop(self: Arc<Self>, inbound: Arc<AsyncMutex<mpsc::Receiver<Frame>>>) {
        loop {
            let next = tokio::select! {
                _ = self.close_signal.cancelled() => break,
                next = async { inbound.lock().await.recv().await } => next,
            };
            let Some(frame) = next else { break };

            let msg_type = frame.msg_type();
            if let Err(e) = self.callback.on_message(&self, frame) {
                warn!(
                    conn_id = self.id,
                    peer = %self.address,
                    msg_type,
                    error = %e,
                    "message handler failed"
                );
                if self.config.dispatch_errors == DispatchErrorPolicy::Close {
                    break;
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.address)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}
