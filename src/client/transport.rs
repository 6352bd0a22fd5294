//! Named groups of outbound connections.
//!
//! A [`TransportClient`] maps each logical peer-group name to its own
//! [`SessionManager`]. Groups are created on first use and never removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::core::{TransportError, TransportResult};
use crate::transport::{Connection, Frame, ManagerConfig, NetAction, SessionManager};

#[derive(Default)]
struct Directory {
    /// Groups in registration order.
    groups: Vec<(String, Arc<SessionManager>)>,
    /// Name to position in `groups`.
    index: HashMap<String, usize>,
}

impl Directory {
    fn get(&self, name: &str) -> Option<&Arc<SessionManager>> {
        self.index.get(name).map(|&i| &self.groups[i].1)
    }
}

/// Directory of named session managers.
pub struct TransportClient {
    directory: RwLock<Directory>,
    manager: ManagerConfig,
    stopped: AtomicBool,
}

impl Default for TransportClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportClient {
    /// Create an empty directory whose groups use the default shard count.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Create an empty directory whose groups use `manager` settings.
    pub fn with_config(manager: ManagerConfig) -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            manager,
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether [`TransportClient::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> TransportResult<()> {
        if self.is_stopped() {
            return Err(TransportError::TransportClosed);
        }
        Ok(())
    }

    /// Return the manager for `name`, creating it on first use.
    ///
    /// Concurrent callers for the same name all receive the same manager.
    pub fn register_group(&self, name: &str) -> TransportResult<Arc<SessionManager>> {
        self.ensure_running()?;
        if let Some(manager) = self.group(name) {
            return Ok(manager);
        }

        let mut dir = self.directory.write();
        // Re-checked under the write lock: a racing caller may have won.
        self.ensure_running()?;
        if let Some(manager) = dir.get(name) {
            return Ok(Arc::clone(manager));
        }

        let manager = SessionManager::with_config(self.manager.clone());
        let position = dir.groups.len();
        dir.groups.push((name.to_owned(), Arc::clone(&manager)));
        dir.index.insert(name.to_owned(), position);
        info!(group = name, "group registered");
        Ok(manager)
    }

    /// Insert `conn` into the manager of its group, creating the group if needed.
    ///
    /// Fails with [`TransportError::UnknownGroup`] for connections without a name.
    pub fn register_connection(&self, conn: &Arc<Connection>) -> TransportResult<()> {
        if conn.name().is_empty() {
            return Err(TransportError::UnknownGroup(String::new()));
        }
        let manager = self.register_group(conn.name())?;
        manager.insert(conn)?;
        debug!(
            group = conn.name(),
            conn_id = conn.id(),
            peer = %conn.address(),
            "connection registered"
        );
        Ok(())
    }

    /// Manager of group `name`, if registered.
    pub fn group(&self, name: &str) -> Option<Arc<SessionManager>> {
        self.directory.read().get(name).cloned()
    }

    /// Registered group names, in registration order.
    pub fn group_names(&self) -> Vec<String> {
        self.directory
            .read()
            .groups
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Live connection `id` of group `name`.
    pub fn get_connection(&self, name: &str, id: u64) -> Option<Arc<Connection>> {
        self.group(name)?.get(id)
    }

    fn resolve(&self, name: &str) -> TransportResult<Arc<SessionManager>> {
        self.ensure_running()?;
        self.group(name)
            .ok_or_else(|| TransportError::NoTargetGroup(name.to_owned()))
    }

    /// Queue `frame` on one connection of `name`, chosen round-robin.
    pub fn send(&self, name: &str, frame: Frame) -> TransportResult<()> {
        let conn = self
            .resolve(name)?
            .rotate()
            .ok_or_else(|| TransportError::NoConnectionAvailable(name.to_owned()))?;
        conn.write(frame)
    }

    /// Queue `frame` on every live connection of `name`. An empty group is not an error.
    pub fn broadcast(&self, name: &str, frame: Frame) -> TransportResult<()> {
        self.resolve(name)?.broadcast(|conn| {
            if let Err(e) = conn.write(frame.clone()) {
                debug!(
                    group = name,
                    conn_id = conn.id(),
                    error = %e,
                    "broadcast skipped connection"
                );
            }
        });
        Ok(())
    }

    /// Close every connection of `name` whose peer address is `address`.
    ///
    /// The reconnect flag is cleared first, so the owning client does not
    /// redial. The group itself stays registered. Returns how many
    /// connections were closed.
    pub async fn remove_by_address(&self, name: &str, address: &str) -> TransportResult<usize> {
        let matches = self.resolve(name)?.get_by_address(address);
        for conn in &matches {
            conn.set_reconnect(false);
            conn.close().await;
        }
        info!(group = name, peer = address, removed = matches.len(), "connections removed");
        Ok(matches.len())
    }

    /// Dispose every group's manager in turn.
    ///
    /// Later sends, broadcasts and registrations fail with
    /// [`TransportError::TransportClosed`].
    pub async fn stop(&self) {
        let groups: Vec<_> = {
            let dir = self.directory.write();
            self.stopped.store(true, Ordering::Release);
            dir.groups.clone()
        };
        for (name, manager) in groups {
            manager.dispose().await;
            debug!(group = %name, "group disposed");
        }
        info!("transport client stopped");
    }
}

impl NetAction for TransportClient {
    fn send(&self, group: &str, frame: Frame) -> TransportResult<()> {
        TransportClient::send(self, group, frame)
    }

    fn broadcast(&self, group: &str, frame: Frame) -> TransportResult<()> {
        TransportClient::broadcast(self, group, frame)
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("groups", &self.group_names())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Codec, ConnectionConfig, FrameCodec, HandlerError, NetworkCallback};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    struct Sink;

    impl NetworkCallback for Sink {
        fn on_message(&self, _conn: &Arc<Connection>, _frame: Frame) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    type Peer = Framed<DuplexStream, FrameCodec>;

    fn outbound(id: u64, name: &str, address: &str) -> (Arc<Connection>, Peer) {
        let (local, peer) = tokio::io::duplex(4096);
        let mut config = ConnectionConfig::client();
        config.heartbeat = None;
        let codec = Codec::from_io(local, FrameCodec::new());
        let conn = Connection::builder(id, codec, Arc::new(Sink))
            .name(name)
            .address(address)
            .config(config)
            .build();
        (conn, Framed::new(peer, FrameCodec::new()))
    }

    async fn next(peer: &mut Peer) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), peer.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap()
    }

    #[test]
    fn test_register_group_once() {
        let client = Arc::new(TransportClient::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || client.register_group("svc").unwrap())
            })
            .collect();

        let managers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for manager in &managers[1..] {
            assert!(Arc::ptr_eq(manager, &managers[0]));
        }
        assert_eq!(client.group_names(), vec!["svc".to_string()]);
    }

    #[test]
    fn test_group_names_keep_order() {
        let client = TransportClient::new();
        for name in ["beta", "alpha", "gamma", "alpha"] {
            client.register_group(name).unwrap();
        }
        assert_eq!(client.group_names(), vec!["beta", "alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_send_rotates_across_group() {
        let client = TransportClient::new();
        let (a, mut peer_a) = outbound(1, "svc", "10.0.0.1:7000");
        let (b, mut peer_b) = outbound(2, "svc", "10.0.0.2:7000");
        for conn in [&a, &b] {
            client.register_connection(conn).unwrap();
            conn.start().unwrap();
        }
        assert!(Arc::ptr_eq(&a.manager().unwrap(), &client.group("svc").unwrap()));

        for i in 0..4u16 {
            client.send("svc", Frame::new(100 + i, &b"m"[..])).unwrap();
        }

        assert_eq!(next(&mut peer_a).await.msg_type(), 100);
        assert_eq!(next(&mut peer_b).await.msg_type(), 101);
        assert_eq!(next(&mut peer_a).await.msg_type(), 102);
        assert_eq!(next(&mut peer_b).await.msg_type(), 103);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let client = TransportClient::new();
        let mut peers = Vec::new();
        for id in 1..=3 {
            let (conn, peer) = outbound(id, "svc", "10.0.0.1:7000");
            client.register_connection(&conn).unwrap();
            conn.start().unwrap();
            peers.push(peer);
        }

        client.broadcast("svc", Frame::new(5, &b"all"[..])).unwrap();
        for peer in &mut peers {
            assert_eq!(next(peer).await.msg_type(), 5);
        }
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let client = TransportClient::new();
        assert!(matches!(
            client.send("missing", Frame::new(1, &b""[..])),
            Err(TransportError::NoTargetGroup(name)) if name == "missing"
        ));
        assert!(matches!(
            client.broadcast("missing", Frame::new(1, &b""[..])),
            Err(TransportError::NoTargetGroup(_))
        ));

        client.register_group("empty").unwrap();
        assert!(matches!(
            client.send("empty", Frame::new(1, &b""[..])),
            Err(TransportError::NoConnectionAvailable(_))
        ));
        client.broadcast("empty", Frame::new(1, &b""[..])).unwrap();

        let (unnamed, _peer) = outbound(9, "", "10.0.0.1:7000");
        assert!(matches!(
            client.register_connection(&unnamed),
            Err(TransportError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_get_connection() {
        let client = TransportClient::new();
        let (conn, _peer) = outbound(4, "svc", "10.0.0.1:7000");
        client.register_connection(&conn).unwrap();

        assert_eq!(client.get_connection("svc", 4).unwrap().id(), 4);
        assert!(client.get_connection("svc", 5).is_none());
        assert!(client.get_connection("other", 4).is_none());
    }

    #[tokio::test]
    async fn test_remove_by_address() {
        let client = TransportClient::new();
        let (a, _pa) = outbound(1, "svc", "10.0.0.1:7000");
        let (b, _pb) = outbound(2, "svc", "10.0.0.2:7000");
        let (c, _pc) = outbound(3, "svc", "10.0.0.1:7000");
        for conn in [&a, &b, &c] {
            client.register_connection(conn).unwrap();
            conn.start().unwrap();
        }

        let removed = client.remove_by_address("svc", "10.0.0.1:7000").await.unwrap();
        assert_eq!(removed, 2);
        assert!(!a.reconnect() && !c.reconnect());
        assert!(b.reconnect());

        let group = client.group("svc").unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group.get(2).unwrap().id(), 2);
        assert_eq!(client.group_names(), vec!["svc"]);
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let client = TransportClient::new();
        let (a, _pa) = outbound(1, "one", "10.0.0.1:7000");
        let (b, _pb) = outbound(2, "two", "10.0.0.2:7000");
        for conn in [&a, &b] {
            client.register_connection(conn).unwrap();
            conn.start().unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), client.stop())
            .await
            .expect("stop should finish");

        assert!(!a.is_running() && !b.is_running());
        assert!(matches!(
            client.send("one", Frame::new(1, &b""[..])),
            Err(TransportError::TransportClosed)
        ));
        assert!(matches!(
            client.register_group("three"),
            Err(TransportError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_net_action_close() {
        let client = TransportClient::new();
        let (conn, _peer) = outbound(1, "svc", "10.0.0.1:7000");
        client.register_connection(&conn).unwrap();
        conn.start().unwrap();

        NetAction::close(&client, &conn);
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("close should finish");
        assert!(client.group("svc").unwrap().is_empty());
    }
}
