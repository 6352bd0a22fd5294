//! Sharded connection registry.
//!
//! Connections live in `shard_count` independently locked maps, keyed by
//! `id % shard_count`. Lookups and scans take one shard lock at a time and
//! never hold it across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::Connection;
use super::sync::WaitGroup;
use crate::core::constants::DEFAULT_SHARD_COUNT;
use crate::core::{TransportError, TransportResult};

/// Session manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of shards, fixed for the manager's lifetime.
    pub shard_count: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

type Shard = RwLock<HashMap<u64, Arc<Connection>>>;

/// Sharded registry of live connections.
pub struct SessionManager {
    shards: Box<[Shard]>,
    cursor: AtomicUsize,
    disposing: AtomicBool,
    disposed: CancellationToken,
    /// One unit per registered connection, released when it deregisters.
    members: WaitGroup,
}

impl SessionManager {
    /// Create a manager with the default shard count.
    pub fn new() -> Arc<Self> {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager from explicit settings. A shard count of zero is raised to one.
    pub fn with_config(config: ManagerConfig) -> Arc<Self> {
        let shards = (0..config.shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Arc::new(Self {
            shards,
            cursor: AtomicUsize::new(0),
            disposing: AtomicBool::new(false),
            disposed: CancellationToken::new(),
            members: WaitGroup::new(),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, id: u64) -> &Shard {
        // Widening `len` to u64 keeps the modulus exact on every platform.
        let index = (id % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Whether [`SessionManager::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Register `conn` and point its owner back-reference at this manager.
    pub fn insert(self: &Arc<Self>, conn: &Arc<Connection>) -> TransportResult<()> {
        {
            let mut shard = self.shard(conn.id()).write();
            // Checked under the shard lock so disposal cannot miss this entry.
            if self.is_disposed() {
                return Err(TransportError::TransportClosed);
            }
            if shard.insert(conn.id(), Arc::clone(conn)).is_none() {
                self.members.add(1);
            }
        }
        conn.set_manager(self);
        debug!(conn_id = conn.id(), peer = %conn.address(), "session registered");
        Ok(())
    }

    /// Deregister `conn`.
    ///
    /// Once disposal has drained the shards the entry is already gone, and
    /// this only releases the connection's completion unit.
    pub fn remove(&self, conn: &Connection) {
        let mut shard = self.shard(conn.id()).write();
        let removed = shard.remove(&conn.id()).is_some();
        // Read under the shard lock: a drained entry always sees the flag.
        let draining = self.is_disposed();
        drop(shard);

        if removed || draining {
            self.members.done();
        }
        if removed {
            debug!(conn_id = conn.id(), peer = %conn.address(), "session removed");
        }
    }

    /// Look up a connection by identifier.
    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.shard(id).read().get(&id).cloned()
    }

    /// Every live connection whose peer address equals `address`.
    pub fn get_by_address(&self, address: &str) -> Vec<Arc<Connection>> {
        let mut found = Vec::new();
        self.broadcast(|conn| {
            if conn.address() == address {
                found.push(Arc::clone(conn));
            }
        });
        found
    }

    /// Snapshot of every live connection, ordered by identifier.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut all = Vec::with_capacity(self.len());
        self.broadcast(|conn| all.push(Arc::clone(conn)));
        all.sort_unstable_by_key(|conn| conn.id());
        all
    }

    /// Round-robin selection over the current live set.
    pub fn rotate(&self) -> Option<Arc<Connection>> {
        let mut live = self.snapshot();
        if live.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live.swap_remove(index))
    }

    /// Pick a random live connection, or `None` when every shard is empty.
    pub fn random(&self) -> Option<Arc<Connection>> {
        let mut rng = rand::thread_rng();
        let count = self.shards.len();
        let start = rng.gen_range(0..count);

        for offset in 0..count {
            let shard = self.shards[(start + offset) % count].read();
            if shard.is_empty() {
                continue;
            }
            let pick = rng.gen_range(0..shard.len());
            return shard.values().nth(pick).cloned();
        }
        None
    }

    /// Invoke `action` once per live connection.
    ///
    /// Each shard is snapshotted under its read lock and the action runs after
    /// the lock is released, so it may touch the manager. Entries inserted or
    /// removed concurrently in other shards may or may not be visited.
    pub fn broadcast<F>(&self, mut action: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for shard in self.shards.iter() {
            let members: Vec<_> = shard.read().values().cloned().collect();
            for conn in &members {
                action(conn);
            }
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Close every managed connection and wait until all of them have torn down.
    ///
    /// Runs once; concurrent and later callers wait for the same completion.
    pub async fn dispose(&self) {
        if self
            .disposing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.disposed.cancelled().await;
            return;
        }

        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            drained.extend(shard.write().drain().map(|(_, conn)| conn));
        }
        info!(connections = drained.len(), "disposing session manager");

        futures::future::join_all(drained.iter().map(|conn| conn.close())).await;
        self.members.wait().await;

        self.disposed.cancel();
        debug!("session manager disposed");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::callback::{HandlerError, NetworkCallback};
    use crate::transport::codec::{Codec, FrameCodec};
    use crate::transport::connection::{ConnState, ConnectionConfig};
    use crate::transport::frame::Frame;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct Silent {
        disconnects: AtomicUsize,
    }

    impl NetworkCallback for Silent {
        fn on_message(&self, _conn: &Arc<Connection>, _frame: Frame) -> Result<(), HandlerError> {
            Ok(())
        }

        fn on_disconnect(&self, _conn: &Arc<Connection>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(id: u64, address: &str, callback: &Arc<Silent>) -> (Arc<Connection>, DuplexStream) {
        let (local, peer) = tokio::io::duplex(4096);
        let conn = Connection::builder(
            id,
            Codec::from_io(local, FrameCodec::new()),
            callback.clone() as Arc<dyn NetworkCallback>,
        )
        .address(address)
        .config(ConnectionConfig::server())
        .build();
        (conn, peer)
    }

    fn silent() -> Arc<Silent> {
        Arc::new(Silent {
            disconnects: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(42, "10.0.0.1:1", &cb);

        manager.insert(&conn).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(42).unwrap().id(), 42);
        assert!(Arc::ptr_eq(&conn.manager().unwrap(), &manager));

        manager.remove(&conn);
        assert!(manager.get(42).is_none());
        assert!(manager.is_empty());
        assert_eq!(manager.members.pending(), 0);

        // Removing twice does not underflow the completion counter.
        manager.remove(&conn);
        assert_eq!(manager.members.pending(), 0);
    }

    #[tokio::test]
    async fn test_shard_placement() {
        let cb = silent();
        let manager = SessionManager::with_config(ManagerConfig { shard_count: 4 });
        let mut peers = Vec::new();
        for id in [1u64, 5, 9, 2] {
            let (conn, peer) = connection(id, "10.0.0.1:1", &cb);
            manager.insert(&conn).unwrap();
            peers.push(peer);
        }

        assert_eq!(manager.shard_count(), 4);
        assert_eq!(manager.shards[1].read().len(), 3);
        assert_eq!(manager.shards[2].read().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_shards_raised() {
        let manager = SessionManager::with_config(ManagerConfig { shard_count: 0 });
        assert_eq!(manager.shard_count(), 1);
        assert!(manager.rotate().is_none());
        assert!(manager.random().is_none());
    }

    #[tokio::test]
    async fn test_get_by_address() {
        let cb = silent();
        let manager = SessionManager::new();
        let mut peers = Vec::new();
        for (id, addr) in [(1u64, "a:1"), (2, "b:1"), (3, "a:1")] {
            let (conn, peer) = connection(id, addr, &cb);
            manager.insert(&conn).unwrap();
            peers.push(peer);
        }

        let mut ids: Vec<_> = manager.get_by_address("a:1").iter().map(|c| c.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert!(manager.get_by_address("c:1").is_empty());
    }

    #[tokio::test]
    async fn test_rotate_is_fair() {
        let cb = silent();
        let manager = SessionManager::new();
        let mut peers = Vec::new();
        for id in 1..=3u64 {
            let (conn, peer) = connection(id, "10.0.0.1:1", &cb);
            manager.insert(&conn).unwrap();
            peers.push(peer);
        }

        let picks: Vec<_> = (0..6).map(|_| manager.rotate().unwrap().id()).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_random_finds_sparse_entry() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(13, "10.0.0.1:1", &cb);
        manager.insert(&conn).unwrap();

        for _ in 0..32 {
            assert_eq!(manager.random().unwrap().id(), 13);
        }
    }

    #[tokio::test]
    async fn test_broadcast_visits_each_once() {
        let cb = silent();
        let manager = SessionManager::new();
        let mut peers = Vec::new();
        for id in 1..=20u64 {
            let (conn, peer) = connection(id, "10.0.0.1:1", &cb);
            manager.insert(&conn).unwrap();
            peers.push(peer);
        }

        let mut seen = Vec::new();
        manager.broadcast(|conn| seen.push(conn.id()));
        assert_eq!(seen.len(), 20);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 20);
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(8, "10.0.0.1:1", &cb);
        manager.insert(&conn).unwrap();
        conn.start().unwrap();

        conn.close().await;
        assert!(manager.get(8).is_none());
        assert_eq!(manager.members.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_deregisters_once() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(8, "10.0.0.1:1", &cb);
        manager.insert(&conn).unwrap();
        conn.start().unwrap();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.close().await })
            })
            .collect();
        tokio::time::timeout(Duration::from_secs(2), async {
            for closer in closers {
                closer.await.unwrap();
            }
        })
        .await
        .expect("every closer should finish");

        assert_eq!(cb.disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.get(8).is_none());
        assert_eq!(manager.members.pending(), 0);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_teardown() {
        let cb = silent();
        let manager = SessionManager::new();
        let mut conns = Vec::new();
        let mut peers = Vec::new();
        for id in 1..=10u64 {
            let (conn, peer) = connection(id, "10.0.0.1:1", &cb);
            manager.insert(&conn).unwrap();
            conn.start().unwrap();
            conns.push(conn);
            peers.push(peer);
        }

        tokio::time::timeout(Duration::from_secs(2), manager.dispose())
            .await
            .expect("dispose should finish");

        assert!(manager.is_empty());
        assert!(manager.is_disposed());
        assert_eq!(cb.disconnects.load(Ordering::SeqCst), 10);
        for conn in &conns {
            assert_eq!(conn.state(), ConnState::Closed);
        }

        let (late, _peer) = connection(99, "10.0.0.1:1", &cb);
        assert!(matches!(
            manager.insert(&late),
            Err(TransportError::TransportClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispose_races_self_closing_connections() {
        for round in 0..200u64 {
            let cb = silent();
            let manager = SessionManager::with_config(ManagerConfig { shard_count: 2 });
            let mut conns = Vec::new();
            let mut peers = Vec::new();
            for id in 1..=8u64 {
                let (conn, peer) = connection(round * 8 + id, "10.0.0.1:1", &cb);
                manager.insert(&conn).unwrap();
                conn.start().unwrap();
                conns.push(conn);
                peers.push(peer);
            }

            let gate = Arc::new(tokio::sync::Barrier::new(conns.len() + 1));
            let closers: Vec<_> = conns
                .iter()
                .map(|conn| {
                    let conn = Arc::clone(conn);
                    let gate = Arc::clone(&gate);
                    tokio::spawn(async move {
                        gate.wait().await;
                        conn.close().await;
                    })
                })
                .collect();
            let disposer = tokio::spawn({
                let manager = Arc::clone(&manager);
                let gate = Arc::clone(&gate);
                async move {
                    gate.wait().await;
                    manager.dispose().await;
                }
            });

            tokio::time::timeout(Duration::from_secs(2), disposer)
                .await
                .expect("dispose should finish")
                .unwrap();
            for closer in closers {
                closer.await.unwrap();
            }
            assert!(manager.is_empty());
            assert_eq!(manager.members.pending(), 0);
            assert_eq!(cb.disconnects.load(Ordering::SeqCst), 8);
        }
    }

    #[tokio::test]
    async fn test_remove_after_drain_releases_unit() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(5, "10.0.0.1:1", &cb);
        manager.insert(&conn).unwrap();

        // Disposal drained the entry before the connection deregistered.
        manager.disposing.store(true, Ordering::Release);
        drop(manager.shard(5).write().remove(&5));
        assert_eq!(manager.members.pending(), 1);

        manager.remove(&conn);
        assert_eq!(manager.members.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_dispose() {
        let cb = silent();
        let manager = SessionManager::new();
        let (conn, _peer) = connection(1, "10.0.0.1:1", &cb);
        manager.insert(&conn).unwrap();
        conn.start().unwrap();

        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.dispose().await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.dispose().await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("both dispose calls should finish");

        assert_eq!(cb.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
