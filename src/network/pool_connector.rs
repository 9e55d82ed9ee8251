//! One-shot bulk connect of a whole pool for one host.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::errors::ConnectError;
use crate::network::connection::{PooledConnection, PooledConnector};
use crate::network::connection_pool::{ConnectionPool, PoolSettings};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::network::transport::ErrorReceiver;

/// Opens `num_connections_per_host` connections to a new host concurrently
/// and aggregates the outcomes.
///
/// Individual failures are classified: transient ones put the slot on the
/// pool's reconnect schedule, critical ones (bad keyspace, rejected
/// credentials) abort the whole pool. The first critical error observed wins
/// and is the one surfaced; remaining in-flight attempts are cancelled.
pub(crate) struct ConnectionPoolConnector {
    pool: Arc<ConnectionPool>,
    address: SocketAddr,
    settings: Arc<PoolSettings>,
    remaining: AtomicUsize,
    state: Mutex<BulkConnectState>,
}

struct BulkConnectState {
    pending: Vec<Arc<PooledConnector>>,
    critical_error: Option<ConnectError>,
    last_error: Option<ConnectError>,
    done: Option<oneshot::Sender<()>>,
}

impl ConnectionPoolConnector {
    /// Connects the full pool for `address`. Returns the pool if at least one
    /// connection was established; the pool keeps refilling its remaining
    /// slots in the background. On failure the pool is closed before
    /// returning.
    pub(crate) async fn connect(
        manager: &Arc<ConnectionPoolManager>,
        address: SocketAddr,
    ) -> Result<Arc<ConnectionPool>, ConnectError> {
        let settings = manager.settings();
        let num_connections = settings.num_connections_per_host.get();
        let pool = ConnectionPool::new(Arc::downgrade(manager), address, Arc::clone(&settings));

        let (done_tx, done_rx) = oneshot::channel();
        let connector = Arc::new(ConnectionPoolConnector {
            pool: Arc::clone(&pool),
            address,
            settings: Arc::clone(&settings),
            remaining: AtomicUsize::new(num_connections),
            state: Mutex::new(BulkConnectState {
                pending: Vec::with_capacity(num_connections),
                critical_error: None,
                last_error: None,
                done: Some(done_tx),
            }),
        });

        let keyspace = manager.keyspace();
        {
            let mut state = connector.state.lock().unwrap();
            for _ in 0..num_connections {
                let pooled = Arc::new(PooledConnector::new(
                    address,
                    Arc::clone(&settings.connector),
                    keyspace.clone(),
                ));
                state.pending.push(Arc::clone(&pooled));

                let connector = Arc::clone(&connector);
                tokio::spawn(async move {
                    let result = pooled.connect().await;
                    connector.handle_connect(&pooled, result);
                });
            }
        }

        // All spawned attempts resolve, so the countdown always fires.
        let _ = done_rx.await;

        let (critical_error, last_error) = {
            let mut state = connector.state.lock().unwrap();
            (state.critical_error.take(), state.last_error.take())
        };

        if let Some(error) = critical_error {
            // handle_connect already closed the pool.
            Err(error)
        } else if pool.has_connections() {
            manager.listener().on_pool_up(address);
            Ok(pool)
        } else {
            manager.listener().on_pool_down(address);
            pool.close();
            Err(last_error.unwrap_or(ConnectError::Timeout))
        }
    }

    fn handle_connect(
        &self,
        connector: &Arc<PooledConnector>,
        result: Result<(Arc<PooledConnection>, ErrorReceiver), ConnectError>,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .retain(|candidate| !Arc::ptr_eq(candidate, connector));

            if !connector.is_cancelled() {
                match result {
                    Ok((connection, error_receiver)) => {
                        self.pool.add_connection(connection, error_receiver);
                    }
                    Err(error) => {
                        error!(
                            "[{}] Pool was unable to connect to the host: {}",
                            self.address, error
                        );
                        if matches!(error, ConnectError::Timeout) {
                            self.settings.metrics.inc_connection_timeouts();
                        }

                        if error.is_critical() {
                            // The first critical error is sticky; later ones
                            // only confirm the verdict.
                            if state.critical_error.is_none() {
                                state.critical_error = Some(error);
                                self.pool.close();
                                for pending in &state.pending {
                                    pending.cancel();
                                }
                            }
                        } else {
                            state.last_error = Some(error);
                            self.pool.schedule_reconnect();
                        }
                    }
                }
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("[{}] Pool connect finished", self.address);
            let done = self.state.lock().unwrap().done.take();
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pool_manager::tests::manager_for_tests;
    use crate::utils::test_utils::{setup_tracing, MockTransport};
    use assert_matches::assert_matches;
    use tokio::time::Duration;

    fn address(last_octet: u8) -> SocketAddr {
        format!("127.0.0.{}:9042", last_octet).parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connects_the_whole_pool() {
        setup_tracing();
        let transport = MockTransport::new();
        let manager = manager_for_tests(&transport, 3);

        let pool = ConnectionPoolConnector::connect(&manager, address(1))
            .await
            .unwrap();
        assert_eq!(pool.connection_and_pending_counts(), (3, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn critical_error_aborts_the_pool_and_is_sticky() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.fail_critically(address(1), ConnectError::Keyspace("nope".into()));
        let manager = manager_for_tests(&transport, 3);

        let result = ConnectionPoolConnector::connect(&manager, address(1)).await;
        let error = result.err().expect("bulk connect should fail");
        assert_matches!(error, ConnectError::Keyspace(name) if name == "nope");

        // No reconnect attempts linger after a critical abort.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_attempts(address(1)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_leave_the_pool_reconnecting() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.refuse_n(address(1), 1);
        let manager = manager_for_tests(&transport, 2);

        let pool = ConnectionPoolConnector::connect(&manager, address(1))
            .await
            .unwrap();
        // One slot connected, the refused one is on the reconnect schedule.
        let (connections, pending) = pool.connection_and_pending_counts();
        assert_eq!(connections + pending, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.connection_and_pending_counts(), (2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn fully_unreachable_host_fails_non_critically() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.refuse(address(1));
        let manager = manager_for_tests(&transport, 2);

        let result = ConnectionPoolConnector::connect(&manager, address(1)).await;
        let error = result.err().expect("bulk connect should fail");
        assert!(!error.is_critical());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_pool_ends_up_closed() {
        setup_tracing();
        let transport = MockTransport::new();
        transport.delay_connects(Duration::from_millis(100));
        transport.fail_critically(address(1), ConnectError::Auth("denied".into()));
        let manager = manager_for_tests(&transport, 4);

        let result = ConnectionPoolConnector::connect(&manager, address(1)).await;
        assert_matches!(result, Err(ConnectError::Auth(_)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        // The pool never reached the manager map.
        assert!(manager.get_pool(address(1)).is_none());
    }
}
