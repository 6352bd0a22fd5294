//! TCP server: accept loop plus a single session manager.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{NetContext, TransportError, TransportResult};
use crate::transport::{
    Connection, ConnectionConfig, DispatchErrorPolicy, Frame, ManagerConfig, NetworkCallback,
    Protocol, SessionManager,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,

    /// Shard count of the server's session manager.
    pub manager: ManagerConfig,

    /// Identifier allocator for accepted connections.
    pub context: Arc<NetContext>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8888)),
            connection: ConnectionConfig::server(),
            manager: ManagerConfig::default(),
            context: NetContext::global(),
        }
    }
}

/// Builder for a [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the idle-read deadline; `None` disables it.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connection.idle_timeout = timeout;
        self
    }

    /// Set the per-connection queue capacity.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.connection.queue_size = size;
        self
    }

    /// Set the number of dispatch duties per connection.
    pub fn dispatchers(mut self, count: usize) -> Self {
        self.config.connection.dispatchers = count;
        self
    }

    /// Set the handler error policy.
    pub fn dispatch_errors(mut self, policy: DispatchErrorPolicy) -> Self {
        self.config.connection.dispatch_errors = policy;
        self
    }

    /// Emit heartbeats from the server side as well.
    pub fn heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.config.connection.heartbeat = interval;
        self
    }

    /// Set the session manager shard count.
    pub fn shard_count(mut self, shards: usize) -> Self {
        self.config.manager.shard_count = shards;
        self
    }

    /// Use a dedicated identifier allocator.
    pub fn context(mut self, context: Arc<NetContext>) -> Self {
        self.config.context = context;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Produces the callback for each accepted connection.
pub trait SessionFactory: Send + Sync + 'static {
    /// Callback for the connection `id` accepted from `peer`.
    fn new_session(&self, id: u64, peer: SocketAddr) -> Arc<dyn NetworkCallback>;
}

impl<F> SessionFactory for F
where
    F: Fn(u64, SocketAddr) -> Arc<dyn NetworkCallback> + Send + Sync + 'static,
{
    fn new_session(&self, id: u64, peer: SocketAddr) -> Arc<dyn NetworkCallback> {
        self(id, peer)
    }
}

/// A listening TCP server.
///
/// # Example
///
/// ```ignore
/// use wirepool::prelude::*;
///
/// let config = ServerBuilder::new()
///     .bind_addr("0.0.0.0:8888".parse()?)
///     .build();
///
/// let handler: Arc<dyn NetworkCallback> = Arc::new(MyHandler);
/// let sessions = move |_id: u64, _peer: SocketAddr| Arc::clone(&handler);
/// let server = Server::listen(config, CommProtocol::default(), sessions).await?;
///
/// let accept = server.spawn();
/// // ...
/// server.stop().await;
/// accept.await??;
/// ```
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,

    /// Taken by the accept loop; `None` once running or stopped.
    listener: Mutex<Option<TcpListener>>,

    protocol: Arc<dyn Protocol>,
    sessions: Arc<dyn SessionFactory>,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
    /// Cancelled once the listening socket has been dropped.
    released: CancellationToken,
}

impl Server {
    /// Bind the listening socket.
    pub async fn listen<P, S>(
        config: ServerConfig,
        protocol: P,
        sessions: S,
    ) -> TransportResult<Arc<Self>>
    where
        P: Protocol,
        S: SessionFactory,
    {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                address: config.bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "server listening");

        Ok(Arc::new(Self {
            manager: SessionManager::with_config(config.manager.clone()),
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            protocol: Arc::new(protocol),
            sessions: Arc::new(sessions),
            shutdown: CancellationToken::new(),
            released: CancellationToken::new(),
        }))
    }

    /// Run the accept loop until [`Server::stop`] is called.
    ///
    /// Accept errors are logged and the loop continues. Fails with
    /// [`TransportError::TransportClosed`] if the loop already ran.
    pub async fn run(self: &Arc<Self>) -> TransportResult<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::TransportClosed)?;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.accept(stream, peer),
                Err(e) => warn!(local_addr = %self.local_addr, error = %e, "accept failed"),
            }
        }

        drop(listener);
        self.released.cancel();
        info!(local_addr = %self.local_addr, "accept loop stopped");
        Ok(())
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<TransportResult<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run().await })
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.config.context.next_conn_id();
        let callback = self.sessions.new_session(id, peer);
        let conn = Connection::builder(id, self.protocol.new_codec(stream), callback)
            .address(peer.to_string())
            .config(self.config.connection.clone())
            .build();

        // A rejected connection is dropped here, which closes the socket.
        if let Err(e) = self.manager.insert(&conn) {
            warn!(conn_id = id, %peer, error = %e, "rejecting connection");
            return;
        }
        metrics::counter!("wirepool_connections_accepted_total").increment(1);
        debug!(conn_id = id, %peer, "connection accepted");

        if let Err(e) = conn.start() {
            warn!(conn_id = id, %peer, error = %e, "failed to start connection");
        }
    }

    /// Queue `frame` on the session `id`.
    pub fn send(&self, id: u64, frame: Frame) -> TransportResult<()> {
        self.manager
            .get(id)
            .ok_or(TransportError::NoSuchSession(id))?
            .write(frame)
    }

    /// Queue `frame` on every live session.
    pub fn broadcast(&self, frame: Frame) {
        self.manager.broadcast(|conn| {
            if let Err(e) = conn.write(frame.clone()) {
                debug!(conn_id = conn.id(), error = %e, "broadcast skipped session");
            }
        });
    }

    /// Look up a live session.
    pub fn session(&self, id: u64) -> Option<Arc<Connection>> {
        self.manager.get(id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.manager.len()
    }

    /// The server's session manager.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stop accepting, close the listener and close every session.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        // A server whose accept loop never ran still holds the listener.
        let idle = self.listener.lock().take();
        if idle.is_some() {
            drop(idle);
            self.released.cancel();
        }
        self.released.cancelled().await;
        self.manager.dispose().await;
        info!(local_addr = %self.local_addr, "server stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.manager.len())
            .finish()
    }
}
