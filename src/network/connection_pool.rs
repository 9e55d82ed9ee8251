//! Per-host connection pools.
//!
//! A pool keeps up to `num_connections_per_host` live connections to one
//! node, replacing broken ones in the background with backoff taken from the
//! configured reconnection policy. `find_least_busy` is the read side used on
//! the hot path and may be called from any thread; mutations go through the
//! pool's write lock.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, trace, warn};

use crate::errors::{ConnectError, ConnectionError};
use crate::network::connection::{PooledConnection, PooledConnector};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::network::transport::{Connector, ErrorReceiver};
use crate::observability::metrics::Metrics;
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};

/// Settings shared by every pool of one pool manager.
#[derive(Clone)]
pub(crate) struct PoolSettings {
    pub(crate) num_connections_per_host: NonZeroUsize,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub(crate) metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseState {
    Open,
    Closing,
    Closed,
}

struct PoolInner {
    close_state: CloseState,
    connections: Vec<Arc<PooledConnection>>,
    pending: Vec<Arc<PooledConnector>>,
}

/// A pool of connections to the same host.
pub(crate) struct ConnectionPool {
    address: SocketAddr,
    settings: Arc<PoolSettings>,
    // Back-reference only; the manager owns the pool. Installed before the
    // pool is published and queried on every notification.
    manager: Weak<ConnectionPoolManager>,
    // Source of owned references for the reconnect and monitor tasks the
    // pool spawns.
    weak_self: Weak<ConnectionPool>,
    inner: RwLock<PoolInner>,
    reconnection_schedule: Mutex<Box<dyn ReconnectionSchedule + Send>>,
}

enum PoolNotification {
    Up,
    Down,
    Closed,
}

impl ConnectionPool {
    pub(crate) fn new(
        manager: Weak<ConnectionPoolManager>,
        address: SocketAddr,
        settings: Arc<PoolSettings>,
    ) -> Arc<Self> {
        let reconnection_schedule = Mutex::new(settings.reconnection_policy.new_schedule());
        Arc::new_cyclic(|weak_self| ConnectionPool {
            address,
            settings,
            manager,
            weak_self: Weak::clone(weak_self),
            inner: RwLock::new(PoolInner {
                close_state: CloseState::Open,
                connections: Vec::new(),
                pending: Vec::new(),
            }),
            reconnection_schedule,
        })
    }

    /// Find the least busy connection for the pool (thread-safe). The least
    /// busy connection has the lowest number of outstanding requests; ties go
    /// to the first one encountered. Returns `None` if the pool has no
    /// connections or is shutting down.
    pub(crate) fn find_least_busy(&self) -> Option<Arc<PooledConnection>> {
        let inner = self.inner.read().unwrap();
        if inner.close_state != CloseState::Open {
            return None;
        }

        let mut best: Option<&Arc<PooledConnection>> = None;
        for connection in &inner.connections {
            match best {
                Some(current) if connection.in_flight_count() >= current.in_flight_count() => {}
                _ => best = Some(connection),
            }
        }
        best.cloned()
    }

    pub(crate) fn has_connections(&self) -> bool {
        !self.inner.read().unwrap().connections.is_empty()
    }

    /// Snapshot of the live connections, for whole-pool operations such as
    /// keyspace propagation.
    pub(crate) fn connections_snapshot(&self) -> Vec<Arc<PooledConnection>> {
        self.inner.read().unwrap().connections.clone()
    }

    #[cfg(test)]
    pub(crate) fn close_state(&self) -> CloseState {
        self.inner.read().unwrap().close_state
    }

    /// Close the pool (thread-safe, idempotent). Live connections are closed
    /// and dropped immediately; the pool lingers in `Closing` until every
    /// pending connect attempt has resolved, then transitions to `Closed` and
    /// reports itself gone to the manager.
    pub(crate) fn close(&self) {
        let notification;
        {
            let mut inner = self.inner.write().unwrap();
            if inner.close_state == CloseState::Open {
                debug!("[{}] Closing connection pool", self.address);
                inner.close_state = CloseState::Closing;
                for connector in &inner.pending {
                    connector.cancel();
                }
                for connection in inner.connections.drain(..) {
                    connection.close();
                    self.settings.metrics.dec_total_connections();
                }
            }
            notification = Self::maybe_closed(&mut inner);
        }
        self.notify(notification);
    }

    /// Add a newly opened connection to the pool. Called by connectors on a
    /// successful handshake; a pool that started closing in the meantime
    /// drops the connection on the floor.
    pub(crate) fn add_connection(
        &self,
        connection: Arc<PooledConnection>,
        error_receiver: ErrorReceiver,
    ) {
        let became_available;
        {
            let mut inner = self.inner.write().unwrap();
            if inner.close_state != CloseState::Open {
                trace!(
                    "[{}] Discarding connection established while the pool was closing",
                    self.address
                );
                connection.close();
                return;
            }
            if inner.connections.len() + inner.pending.len()
                >= self.settings.num_connections_per_host.get()
            {
                // A slot race; the pool is already at target size.
                connection.close();
                return;
            }

            became_available = inner.connections.is_empty();
            inner.connections.push(Arc::clone(&connection));
            trace!(
                "[{}] Added connection to the pool, now {}",
                self.address,
                inner.connections.len()
            );
        }
        self.settings.metrics.inc_total_connections();
        self.reconnection_schedule.lock().unwrap().reset();
        self.spawn_monitor(connection, error_receiver);

        if became_available {
            self.notify(Some(PoolNotification::Up));
        }
    }

    /// Remove a connection that broke and, while the pool is open, schedule a
    /// reconnect for its slot.
    pub(crate) fn close_connection(
        &self,
        connection: &Arc<PooledConnection>,
        error: ConnectionError,
    ) {
        let notification;
        {
            let mut inner = self.inner.write().unwrap();
            let before = inner.connections.len();
            inner
                .connections
                .retain(|candidate| !Arc::ptr_eq(candidate, connection));
            if inner.connections.len() == before {
                // Already removed, e.g. by close().
                return;
            }
            connection.close();
            self.settings.metrics.dec_total_connections();
            debug!(
                "[{}] Connection lost ({}), {} remain",
                self.address,
                error,
                inner.connections.len()
            );

            match inner.close_state {
                CloseState::Open => {
                    self.schedule_reconnect_locked(&mut inner);
                    notification = if inner.connections.is_empty() {
                        Some(PoolNotification::Down)
                    } else {
                        None
                    };
                }
                _ => notification = Self::maybe_closed(&mut inner),
            }
        }
        self.notify(notification);
    }

    /// Schedule a new connection attempt for this pool, delayed according to
    /// the reconnection policy.
    pub(crate) fn schedule_reconnect(&self) {
        let mut inner = self.inner.write().unwrap();
        self.schedule_reconnect_locked(&mut inner);
    }

    fn schedule_reconnect_locked(&self, inner: &mut PoolInner) {
        if inner.close_state != CloseState::Open {
            return;
        }
        if inner.connections.len() + inner.pending.len()
            >= self.settings.num_connections_per_host.get()
        {
            return;
        }

        let delay = self.reconnection_schedule.lock().unwrap().next_delay();
        let keyspace = self
            .manager
            .upgrade()
            .and_then(|manager| manager.keyspace());
        let connector = Arc::new(PooledConnector::new(
            self.address,
            Arc::clone(&self.settings.connector),
            keyspace,
        ));
        inner.pending.push(Arc::clone(&connector));
        debug!(
            "[{}] Scheduling reconnect in {} ms",
            self.address,
            delay.as_millis()
        );

        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if !delay.is_zero() {
                // Cancellation interrupts the backoff wait, so a closing pool
                // drains its pending set promptly.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = connector.cancelled() => {}
                }
            }
            let result = if connector.is_cancelled() {
                None
            } else {
                Some(connector.connect().await)
            };
            pool.handle_reconnect(&connector, result);
        });
    }

    /// Completion handler of a reconnect attempt. A cancelled connector only
    /// drains from the pending set; it must not mutate the closing pool.
    fn handle_reconnect(
        &self,
        connector: &Arc<PooledConnector>,
        result: Option<Result<(Arc<PooledConnection>, ErrorReceiver), ConnectError>>,
    ) {
        let notification;
        {
            let mut inner = self.inner.write().unwrap();
            inner
                .pending
                .retain(|candidate| !Arc::ptr_eq(candidate, connector));
            notification = Self::maybe_closed(&mut inner);
        }
        self.notify(notification);

        if connector.is_cancelled() {
            // A handshake that won the race against cancellation still
            // produced a live connection; close it instead of leaking it.
            if let Some(Ok((connection, _))) = result {
                connection.close();
            }
            return;
        }
        match result {
            Some(Ok((connection, error_receiver))) => {
                self.add_connection(connection, error_receiver);
            }
            Some(Err(error)) => {
                warn!("[{}] Reconnect attempt failed: {}", self.address, error);
                if matches!(error, ConnectError::Timeout) {
                    self.settings.metrics.inc_connection_timeouts();
                }
                self.schedule_reconnect();
            }
            None => {}
        }
    }

    // Once closing and fully drained, the pool is gone for good.
    fn maybe_closed(inner: &mut PoolInner) -> Option<PoolNotification> {
        if inner.close_state == CloseState::Closing
            && inner.connections.is_empty()
            && inner.pending.is_empty()
        {
            inner.close_state = CloseState::Closed;
            Some(PoolNotification::Closed)
        } else {
            None
        }
    }

    // Watches for the connection breaking and feeds the event back into the
    // pool. A dropped sender counts as a close.
    fn spawn_monitor(&self, connection: Arc<PooledConnection>, receiver: ErrorReceiver) {
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let error = receiver.await.unwrap_or(ConnectionError::Closed);
            pool.close_connection(&connection, error);
        });
    }

    fn notify(&self, notification: Option<PoolNotification>) {
        let Some(notification) = notification else {
            return;
        };
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match notification {
            PoolNotification::Up => manager.listener().on_pool_up(self.address),
            PoolNotification::Down => manager.listener().on_pool_down(self.address),
            PoolNotification::Closed => manager.pool_closed(self.address),
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_and_pending_counts(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        (inner.connections.len(), inner.pending.len())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("close_state", &inner.close_state)
            .field("connections", &inner.connections.len())
            .field("pending", &inner.pending.len())
            .finish_non_exhaustive()
    }
}
