//! The facade over every per-host pool of one request processor.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arc_swap::ArcSwapOption;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::ConnectError;
use crate::network::connection::PooledConnection;
use crate::network::connection_pool::{ConnectionPool, PoolSettings};
use crate::network::pool_connector::ConnectionPoolConnector;
use crate::network::transport::VerifiedKeyspaceName;

/// Host-availability events reported by the pools. Implemented by the request
/// processor owning the manager.
pub(crate) trait ConnectionPoolListener: Send + Sync {
    /// The host's pool went from zero to at least one live connection.
    fn on_pool_up(&self, address: SocketAddr);
    /// The host's pool lost its last live connection.
    fn on_pool_down(&self, address: SocketAddr);
    /// The host's pool hit an error that reconnecting cannot fix.
    fn on_pool_critical_error(&self, address: SocketAddr, error: ConnectError);
}

/// A host that failed to connect during manager initialization.
#[derive(Debug)]
pub(crate) struct ConnectFailure {
    pub(crate) address: SocketAddr,
    pub(crate) error: ConnectError,
}

/// Maps host addresses to their connection pools and owns the current
/// keyspace of the session as seen by this processor.
pub(crate) struct ConnectionPoolManager {
    settings: Arc<PoolSettings>,
    listener: Arc<dyn ConnectionPoolListener>,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    pools: RwLock<HashMap<SocketAddr, Arc<ConnectionPool>>>,
    // Addresses with a bulk connect in flight; absorbs duplicate `add`s.
    connecting: Mutex<HashSet<SocketAddr>>,
    weak_self: Weak<ConnectionPoolManager>,
    is_closing: AtomicBool,
    drained_notify: Notify,
}

impl ConnectionPoolManager {
    /// Builds a manager and concurrently connects a pool for every address.
    /// Hosts that could not be connected are returned as failures; the caller
    /// decides whether any of them (e.g. a missing keyspace) is fatal.
    pub(crate) async fn connect(
        settings: Arc<PoolSettings>,
        listener: Arc<dyn ConnectionPoolListener>,
        keyspace: Option<VerifiedKeyspaceName>,
        addresses: Vec<SocketAddr>,
    ) -> (Arc<Self>, Vec<ConnectFailure>) {
        let manager = Arc::new_cyclic(|weak_self| ConnectionPoolManager {
            settings,
            listener,
            keyspace: ArcSwapOption::from(keyspace.map(Arc::new)),
            pools: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            weak_self: Weak::clone(weak_self),
            is_closing: AtomicBool::new(false),
            drained_notify: Notify::new(),
        });

        let mut connects: FuturesUnordered<_> = addresses
            .into_iter()
            .map(|address| {
                let manager = Arc::clone(&manager);
                async move {
                    (
                        address,
                        ConnectionPoolConnector::connect(&manager, address).await,
                    )
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((address, result)) = connects.next().await {
            match result {
                Ok(pool) => manager.insert_pool(address, pool),
                Err(error) => failures.push(ConnectFailure { address, error }),
            }
        }

        (manager, failures)
    }

    pub(crate) fn settings(&self) -> Arc<PoolSettings> {
        Arc::clone(&self.settings)
    }

    pub(crate) fn listener(&self) -> &Arc<dyn ConnectionPoolListener> {
        &self.listener
    }

    pub(crate) fn keyspace(&self) -> Option<VerifiedKeyspaceName> {
        self.keyspace.load_full().map(|name| (*name).clone())
    }

    /// Find the least busy connection for the given host (thread-safe).
    pub(crate) fn find_least_busy(&self, address: SocketAddr) -> Option<Arc<PooledConnection>> {
        self.pools
            .read()
            .unwrap()
            .get(&address)
            .and_then(|pool| pool.find_least_busy())
    }

    /// Addresses whose pools currently hold at least one live connection.
    pub(crate) fn available(&self) -> Vec<SocketAddr> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .filter(|(_, pool)| pool.has_connections())
            .map(|(address, _)| *address)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn get_pool(&self, address: SocketAddr) -> Option<Arc<ConnectionPool>> {
        self.pools.read().unwrap().get(&address).cloned()
    }

    /// Starts a pool for a newly discovered host. Duplicate calls for a host
    /// that already has a pool, or one mid-connect, are absorbed.
    pub(crate) fn add(&self, address: SocketAddr) {
        if self.is_closing.load(Ordering::Acquire) {
            return;
        }
        if self.pools.read().unwrap().contains_key(&address) {
            return;
        }
        if !self.connecting.lock().unwrap().insert(address) {
            return;
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = ConnectionPoolConnector::connect(&manager, address).await;
            match result {
                Ok(pool) => {
                    if manager.is_closing.load(Ordering::Acquire) {
                        pool.close();
                    } else {
                        manager.insert_pool(address, pool);
                    }
                }
                Err(error) => {
                    warn!("[{}] Unable to add pool for host: {}", address, error);
                    if error.is_critical() {
                        manager.listener.on_pool_critical_error(address, error);
                    }
                }
            }
            manager.connecting.lock().unwrap().remove(&address);
            manager.maybe_drained();
        });
    }

    /// Installs a new current keyspace and propagates it to every live
    /// connection. Connections established later pick the keyspace up at
    /// handshake time.
    pub(crate) fn set_keyspace(&self, keyspace: VerifiedKeyspaceName) {
        self.keyspace.store(Some(Arc::new(keyspace.clone())));

        let connections: Vec<Arc<PooledConnection>> = self
            .pools
            .read()
            .unwrap()
            .values()
            .flat_map(|pool| pool.connections_snapshot())
            .collect();
        if connections.is_empty() {
            return;
        }

        tokio::spawn(async move {
            let switches = connections.iter().map(|connection| {
                let keyspace = &keyspace;
                async move {
                    (
                        connection.address(),
                        connection.transport().use_keyspace(keyspace).await,
                    )
                }
            });
            for (address, result) in futures::future::join_all(switches).await {
                if let Err(error) = result {
                    warn!("[{}] Failed to switch keyspace: {}", address, error);
                }
            }
        });
    }

    /// Closes every pool. Completion is observable through `await_closed`.
    pub(crate) fn close(&self) {
        if self.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing connection pool manager");
        let pools: Vec<Arc<ConnectionPool>> =
            self.pools.read().unwrap().values().cloned().collect();
        for pool in pools {
            pool.close();
        }
        self.maybe_drained();
    }

    /// Resolves once every pool has transitioned to closed and no bulk
    /// connect is in flight anymore. Call after `close`.
    pub(crate) async fn await_closed(&self) {
        let drained = self.drained_notify.notified();
        tokio::pin!(drained);
        loop {
            // Register before checking, or a notification landing in between
            // is lost and this never wakes.
            drained.as_mut().enable();
            if self.is_drained() {
                return;
            }
            drained.as_mut().await;
            drained.set(self.drained_notify.notified());
        }
    }

    /// Releases manager-held resources. Must only be called after `close`
    /// has completed.
    pub(crate) fn close_handles(&self) {
        debug_assert!(self.is_closing.load(Ordering::Acquire));
        self.keyspace.store(None);
    }

    /// Called by a pool that reached its terminal state.
    pub(crate) fn pool_closed(&self, address: SocketAddr) {
        let removed = self.pools.write().unwrap().remove(&address);
        if removed.is_some() {
            debug!("[{}] Pool closed and removed", address);
        }
        self.maybe_drained();
    }

    fn insert_pool(&self, address: SocketAddr, pool: Arc<ConnectionPool>) {
        self.pools.write().unwrap().insert(address, pool);
    }

    fn is_drained(&self) -> bool {
        self.pools.read().unwrap().is_empty() && self.connecting.lock().unwrap().is_empty()
    }

    fn maybe_drained(&self) {
        if self.is_closing.load(Ordering::Acquire) && self.is_drained() {
            self.drained_notify.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("pools", &self.pools.read().unwrap().len())
            .field("is_closing", &self.is_closing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::observability::metrics::Metrics;
    use crate::policies::reconnection::ExponentialReconnectionPolicy;
    use crate::utils::test_utils::{setup_tracing, MockTransport, RecordingPoolListener};
    use std::num::NonZeroUsize;
    use tokio::time::Duration;

    pub(crate) fn manager_for_tests(
        transport: &MockTransport,
        num_connections: usize,
    ) -> Arc<ConnectionPoolManager> {
        manager_with_listener(transport, num_connections, Arc::new(RecordingPoolListener::new())).0
    }

    pub(crate) fn manager_with_listener(
        transport: &MockTransport,
        num_connections: usize,
        listener: Arc<RecordingPoolListener>,
    ) -> (Arc<ConnectionPoolManager>, Arc<RecordingPoolListener>) {
        let settings = Arc::new(PoolSettings {
            num_connections_per_host: NonZeroUsize::new(num_connections).unwrap(),
            connector: transport.connector(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(100),
            )),
            metrics: Arc::new(Metrics::new()),
        });
        let manager = Arc::new_cyclic(|weak_self| ConnectionPoolManager {
            settings,
            listener: listener.clone(),
            keyspace: ArcSwapOption::empty(),
            pools: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            weak_self: Weak::clone(weak_self),
            is_closing: AtomicBool::new(false),
            drained_notify: Notify::new(),
        });
        (manager, listener)
    }

    async fn connected_manager(
        transport: &MockTransport,
        num_connections: usize,
        addresses: &[SocketAddr],
    ) -> (Arc<ConnectionPoolManager>, Vec<ConnectFailure>) {
        let settings = Arc::new(PoolSettings {
            num_connections_per_host: NonZeroUsize::new(num_connections).unwrap(),
            connector: transport.connector(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(100),
            )),
            metrics: Arc::new(Metrics::new()),
        });
        ConnectionPoolManager::connect(
            settings,
            Arc::new(RecordingPoolListener::new()),
            None,
            addresses.to_vec(),
        )
        .await
    }

    fn address(last_octet: u8) -> SocketAddr {
        format!("127.0.0.{}:9042", last_octet).parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connects_pools_and_reports_failures() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.refuse(address(3));
        let addresses = [address(1), address(2), address(3)];

        let (manager, failures) = connected_manager(&transport, 2, &addresses).await;

        let mut available = manager.available();
        available.sort_unstable();
        assert_eq!(available, vec![address(1), address(2)]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].address, address(3));
        assert!(manager.find_least_busy(address(1)).is_some());
        assert!(manager.find_least_busy(address(3)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_connect_reports_host_availability() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.refuse(address(2));
        let (manager, listener) = manager_with_listener(
            &transport,
            1,
            Arc::new(RecordingPoolListener::new()),
        );

        let connected =
            crate::network::pool_connector::ConnectionPoolConnector::connect(&manager, address(1))
                .await;
        assert!(connected.is_ok());
        let failed =
            crate::network::pool_connector::ConnectionPoolConnector::connect(&manager, address(2))
                .await;
        assert!(failed.is_err());

        let events = listener.events();
        assert!(events.contains(&("up".to_string(), address(1))));
        assert!(events.contains(&("down".to_string(), address(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_add_is_absorbed() {
        setup_tracing();
        let transport = MockTransport::new();
        let (manager, _) = connected_manager(&transport, 2, &[address(1)]).await;

        manager.add(address(2));
        manager.add(address(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.add(address(2));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.connect_attempts(address(2)), 2);
        assert!(manager.get_pool(address(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn keyspace_propagates_to_live_connections() {
        setup_tracing();
        let transport = MockTransport::new();
        let (manager, _) = connected_manager(&transport, 2, &[address(1), address(2)]).await;

        manager.set_keyspace(VerifiedKeyspaceName::new("ks1").unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 2 hosts x 2 connections switched.
        assert_eq!(transport.keyspace_switches("ks1"), 4);
        assert_eq!(manager.keyspace().unwrap().as_str(), "ks1");
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_every_pool() {
        setup_tracing();
        let transport = MockTransport::new();
        let (manager, _) = connected_manager(&transport, 2, &[address(1), address(2)]).await;

        manager.close();
        manager.await_closed().await;

        assert!(manager.available().is_empty());
        assert!(manager.find_least_busy(address(1)).is_none());
        manager.close_handles();
    }

    #[tokio::test(start_paused = true)]
    async fn add_racing_close_does_not_leak_a_pool() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.delay_connects(Duration::from_millis(200));
        let (manager, _) = connected_manager(&transport, 1, &[]).await;

        manager.add(address(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.close();
        manager.await_closed().await;

        assert!(manager.get_pool(address(1)).is_none());
        assert!(manager.available().is_empty());
    }
}
