//! Dialing client with automatic reconnect.
//!
//! A [`ServiceClient`] dials named peers, registers the resulting outbound
//! connections with its [`TransportClient`] and redials after a backoff when
//! a dial fails or a connection drops while its reconnect flag is set.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::TransportClient;
use crate::core::constants::{CONNECT_TIMEOUT, RECONNECT_BACKOFF};
use crate::core::{NetContext, TransportError, TransportResult};
use crate::transport::{
    Connection, ConnectionConfig, DispatchErrorPolicy, Frame, HandlerError, ManagerConfig,
    NetAction, NetworkCallback, Protocol,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Settings applied to every dialed connection.
    pub connection: ConnectionConfig,

    /// Dial timeout.
    pub connect_timeout: Duration,

    /// Delay before redialing after a failure or disconnect.
    pub reconnect_backoff: Duration,

    /// Shard count of each group's session manager.
    pub manager: ManagerConfig,

    /// Identifier allocator for dialed connections.
    pub context: Arc<NetContext>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::client(),
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_backoff: RECONNECT_BACKOFF,
            manager: ManagerConfig::default(),
            context: NetContext::global(),
        }
    }
}

/// Builder for a [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dial timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the redial delay.
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.config.reconnect_backoff = backoff;
        self
    }

    /// Enable or disable redialing.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.connection.reconnect = enabled;
        self
    }

    /// Set the heartbeat interval; `None` disables heartbeats.
    pub fn heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.config.connection.heartbeat = interval;
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

    /// Set the idle-read deadline; `None` disables it.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connection.idle_timeout = timeout;
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

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Forwards events to the application callback and schedules redials.
struct Redial {
    client: Weak<ServiceClient>,
    inner: Arc<dyn NetworkCallback>,
}

impl NetworkCallback for Redial {
    fn on_message(&self, conn: &Arc<Connection>, frame: Frame) -> Result<(), HandlerError> {
        self.inner.on_message(conn, frame)
    }

    fn on_connect(&self, conn: &Arc<Connection>) {
        self.inner.on_connect(conn);
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        self.inner.on_disconnect(conn);
        if !conn.reconnect() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.schedule_redial(conn.name(), conn.address());
        }
    }
}

/// Outbound client for named peer groups.
pub struct ServiceClient {
    config: ClientConfig,
    transport: Arc<TransportClient>,
    protocol: Arc<dyn Protocol>,
    callback: Arc<dyn NetworkCallback>,
    shutdown: CancellationToken,
}

impl ServiceClient {
    /// Create a client whose connections report to `callback`.
    pub fn new<P>(
        config: ClientConfig,
        protocol: P,
        callback: Arc<dyn NetworkCallback>,
    ) -> Arc<Self>
    where
        P: Protocol,
    {
        Arc::new_cyclic(|client| Self {
            transport: Arc::new(TransportClient::with_config(config.manager.clone())),
            config,
            protocol: Arc::new(protocol),
            callback: Arc::new(Redial {
                client: client.clone(),
                inner: callback,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// The underlying group directory.
    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dial `address`, register the connection under group `name` and start it.
    ///
    /// On dial failure the error is returned and, when reconnect is enabled,
    /// a redial is scheduled after the configured backoff.
    pub async fn register_client(
        self: &Arc<Self>,
        name: &str,
        address: &str,
    ) -> TransportResult<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::TransportClosed);
        }

        let stream = match self.dial(address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(group = name, peer = address, error = %e, "dial failed");
                if self.config.connection.reconnect {
                    self.schedule_redial(name, address);
                }
                return Err(e);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = address, error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.config.context.next_conn_id();
        let codec = self.protocol.new_codec(stream);
        let conn = Connection::builder(id, codec, Arc::clone(&self.callback))
            .name(name)
            .address(address)
            .config(self.config.connection.clone())
            .build();

        self.transport.register_connection(&conn)?;
        conn.start()?;
        info!(group = name, conn_id = id, peer = address, "client connected");
        Ok(conn)
    }

    async fn dial(&self, address: &str) -> TransportResult<TcpStream> {
        let connect = TcpStream::connect(address);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(TransportError::ConnectTimeout(address.to_owned())),
        }
    }

    /// Dial in the background. The outcome is logged and available on the handle.
    pub fn add_client(
        self: &Arc<Self>,
        name: &str,
        address: &str,
    ) -> JoinHandle<TransportResult<Arc<Connection>>> {
        let client = Arc::clone(self);
        let (name, address) = (name.to_owned(), address.to_owned());
        tokio::spawn(async move { client.register_client(&name, &address).await })
    }

    /// Close every connection of `name` to `address` without redialing.
    pub async fn remove_client(&self, name: &str, address: &str) -> TransportResult<usize> {
        self.transport.remove_by_address(name, address).await
    }

    /// Queue `frame` on one connection of `name`, chosen round-robin.
    pub fn send(&self, name: &str, frame: Frame) -> TransportResult<()> {
        self.transport.send(name, frame)
    }

    /// Queue `frame` on every connection of `name`.
    pub fn broadcast(&self, name: &str, frame: Frame) -> TransportResult<()> {
        self.transport.broadcast(name, frame)
    }

    /// Cancel pending redials and close every connection.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.transport.stop().await;
    }

    fn schedule_redial(self: &Arc<Self>, name: &str, address: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let backoff = self.config.reconnect_backoff;
        info!(
            group = name,
            peer = address,
            backoff_ms = backoff.as_millis() as u64,
            "scheduling reconnect"
        );

        let client = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let (name, address) = (name.to_owned(), address.to_owned());
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            let Some(client) = client.upgrade() else {
                return;
            };
            // A failed attempt schedules the next one itself.
            if let Err(e) = client.register_client(&name, &address).await {
                debug!(group = %name, peer = %address, error = %e, "reconnect attempt failed");
            }
        });
    }
}

impl NetAction for ServiceClient {
    fn send(&self, group: &str, frame: Frame) -> TransportResult<()> {
        self.transport.send(group, frame)
    }

    fn broadcast(&self, group: &str, frame: Frame) -> TransportResult<()> {
        self.transport.broadcast(group, frame)
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("transport", &self.transport)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}
