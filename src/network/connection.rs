//! Pooled connections and the one-shot connectors that open them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::errors::ConnectError;
use crate::network::transport::{
    Connection, Connector, ErrorReceiver, Request, ResponseSink, VerifiedKeyspaceName,
};

/// A connection owned by a [`ConnectionPool`](crate::network::ConnectionPool).
///
/// Wraps the transport connection with an atomic in-flight request counter,
/// which is what `find_least_busy` ranks connections by.
pub(crate) struct PooledConnection {
    connection: Arc<dyn Connection>,
    address: SocketAddr,
    in_flight: Arc<AtomicUsize>,
}

impl PooledConnection {
    pub(crate) fn new(connection: Arc<dyn Connection>, address: SocketAddr) -> Self {
        PooledConnection {
            connection,
            address,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Writes a request onto the connection, counting it as in-flight until
    /// the sink fires or is dropped. Returns `false` if the transport refused
    /// the write; the sink is dropped unused in that case and the in-flight
    /// count is unaffected.
    pub(crate) fn write(&self, request: Request, sink: ResponseSink) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };

        let wrapped: ResponseSink = Box::new(move |result| {
            let _guard = guard;
            sink(result);
        });

        self.connection.write(request, wrapped)
    }

    /// Number of requests currently in flight. Readable from any thread.
    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn close(&self) {
        self.connection.close();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

// Decrements in-flight on both completion and abandonment. A sink dropped by
// a dying connection must not leave the count inflated, or the connection
// would look busy to `find_least_busy` forever.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A one-shot handshake producing a [`PooledConnection`].
///
/// Cancellation is cooperative: a cancelled connector still runs to
/// completion, but its completion handler must treat the result as void and
/// must not mutate a closing pool.
pub(crate) struct PooledConnector {
    endpoint: SocketAddr,
    connector: Arc<dyn Connector>,
    keyspace: Option<VerifiedKeyspaceName>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl PooledConnector {
    pub(crate) fn new(
        endpoint: SocketAddr,
        connector: Arc<dyn Connector>,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        PooledConnector {
            endpoint,
            connector,
            keyspace,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub(crate) async fn connect(
        &self,
    ) -> Result<(Arc<PooledConnection>, ErrorReceiver), ConnectError> {
        let (connection, error_receiver) = self
            .connector
            .connect(self.endpoint, self.keyspace.as_ref())
            .await?;
        Ok((
            Arc::new(PooledConnection::new(connection, self.endpoint)),
            error_receiver,
        ))
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the connector is cancelled. Never resolves otherwise.
    pub(crate) async fn cancelled(&self) {
        let notified = self.cancel_notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking, or a cancel landing in between is
            // lost and this never wakes.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.cancel_notify.notified());
        }
    }
}

impl std::fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnector")
            .field("endpoint", &self.endpoint)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{MockTransport, ManualResponses};
    use crate::network::transport::Response;

    #[tokio::test]
    async fn in_flight_counting() {
        let transport = MockTransport::new();
        let manual = ManualResponses::install(&transport);
        let address: SocketAddr = "127.0.0.1:9042".parse().unwrap();

        let connector = PooledConnector::new(address, transport.connector(), None);
        let (conn, _err) = connector.connect().await.unwrap();

        assert_eq!(conn.in_flight_count(), 0);
        assert!(conn.write(Request::SchemaVersions, Box::new(|_| {})));
        assert!(conn.write(Request::SchemaVersions, Box::new(|_| {})));
        assert_eq!(conn.in_flight_count(), 2);
        assert_eq!(manual.pending_count(), 2);

        // Completing a request releases its slot.
        manual.complete_one(Ok(Response::Void));
        assert_eq!(conn.in_flight_count(), 1);

        // Dropping a pending sink (connection died) releases it too.
        manual.drop_one();
        assert_eq!(conn.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn refused_write_does_not_leak_in_flight() {
        let transport = MockTransport::new();
        let address: SocketAddr = "127.0.0.1:9042".parse().unwrap();

        let connector = PooledConnector::new(address, transport.connector(), None);
        let (conn, _err) = connector.connect().await.unwrap();

        conn.close();
        assert!(!conn.write(Request::SchemaVersions, Box::new(|_| {})));
        assert_eq!(conn.in_flight_count(), 0);
    }
}
