//! In-process transport and control-connection mocks shared by the unit
//! tests. No real sockets; behavior is scripted per host address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control::{ControlConnector, ControlEvent, ControlHandle};
use crate::cluster::host::{Host, HostDistance, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{ConnectError, ConnectionError, DbError, RequestError};
use crate::execution::processor::{ProcessorSettings, RequestProcessor, SessionEvent};
use crate::execution::request_handler::RequestHandler;
use crate::execution::request_queue::RequestQueue;
use crate::execution::RequestListener;
use crate::network::connection_pool::PoolSettings;
use crate::network::pool_manager::{ConnectionPoolListener, ConnectionPoolManager};
use crate::network::transport::{
    Connection, Connector, ErrorReceiver, Request, Response, ResponseSink, VerifiedKeyspaceName,
};
use crate::observability::metrics::Metrics;
use crate::policies::load_balancing::{LoadBalancingPolicy, QueryPlan};
use crate::policies::reconnection::ExponentialReconnectionPolicy;
use crate::policies::timestamp_generator::{MonotonicTimestampGenerator, TimestampGenerator};
use crate::statement::PreparedStatement;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct MockState {
    next_connection_id: AtomicU64,
    connect_attempts: Mutex<HashMap<SocketAddr, usize>>,
    refused: Mutex<HashSet<SocketAddr>>,
    refused_counts: Mutex<HashMap<SocketAddr, usize>>,
    critical: Mutex<HashMap<SocketAddr, ConnectError>>,
    connect_delay: Mutex<Option<Duration>>,
    write_refused: Mutex<HashSet<SocketAddr>>,
    error_responses: Mutex<HashMap<SocketAddr, DbError>>,
    manual_all: AtomicBool,
    manual_addrs: Mutex<HashSet<SocketAddr>>,
    pending: Mutex<VecDeque<(u64, SocketAddr, ResponseSink)>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    request_log: Mutex<Vec<(SocketAddr, String)>>,
    keyspace_log: Mutex<Vec<(SocketAddr, String)>>,
    schema_versions: Mutex<Vec<Uuid>>,
    result_metadata_id: Mutex<Option<Bytes>>,
}

/// Scripted in-process transport.
#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let state = MockState::default();
        let agreed = Uuid::new_v4();
        *state.schema_versions.lock().unwrap() = vec![agreed, agreed];
        MockTransport {
            state: Arc::new(state),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub(crate) fn connect_attempts(&self, address: SocketAddr) -> usize {
        self.state
            .connect_attempts
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Makes every connect to `address` fail with a network error.
    pub(crate) fn refuse(&self, address: SocketAddr) {
        self.state.refused.lock().unwrap().insert(address);
    }

    pub(crate) fn accept(&self, address: SocketAddr) {
        self.state.refused.lock().unwrap().remove(&address);
    }

    /// Makes the next `n` connects to `address` fail, then recover.
    pub(crate) fn refuse_n(&self, address: SocketAddr, n: usize) {
        self.state.refused_counts.lock().unwrap().insert(address, n);
    }

    pub(crate) fn fail_critically(&self, address: SocketAddr, error: ConnectError) {
        self.state.critical.lock().unwrap().insert(address, error);
    }

    pub(crate) fn delay_connects(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Breaks one live connection to `address`, as a peer reset would.
    pub(crate) fn kill_one(&self, address: SocketAddr) {
        let connection = self
            .state
            .connections
            .lock()
            .unwrap()
            .iter()
            .find(|connection| {
                connection.address == address && !connection.closed.load(Ordering::Acquire)
            })
            .cloned();
        if let Some(connection) = connection {
            connection.kill(ConnectionError::Closed);
        }
    }

    /// Connections to `address` refuse every write (closed / out of stream
    /// ids).
    pub(crate) fn refuse_writes(&self, address: SocketAddr) {
        self.state.write_refused.lock().unwrap().insert(address);
    }

    /// Every request to `address` is answered with the given database error.
    pub(crate) fn respond_with_error(&self, address: SocketAddr, error: DbError) {
        self.state
            .error_responses
            .lock()
            .unwrap()
            .insert(address, error);
    }

    pub(crate) fn set_schema_versions(&self, versions: Vec<Uuid>) {
        *self.state.schema_versions.lock().unwrap() = versions;
    }

    pub(crate) fn set_result_metadata_id(&self, id: Option<Bytes>) {
        *self.state.result_metadata_id.lock().unwrap() = id;
    }

    /// Statement contents, in global write order.
    pub(crate) fn request_log(&self) -> Vec<String> {
        self.state
            .request_log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, contents)| contents.clone())
            .collect()
    }

    pub(crate) fn requests_at(&self, address: SocketAddr) -> Vec<String> {
        self.state
            .request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(at, _)| *at == address)
            .map(|(_, contents)| contents.clone())
            .collect()
    }

    /// How many connections have switched to the given keyspace.
    pub(crate) fn keyspace_switches(&self, keyspace: &str) -> usize {
        self.state
            .keyspace_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name)| name == keyspace)
            .count()
    }

    pub(crate) fn live_connection_count(&self) -> usize {
        self.state
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|connection| !connection.closed.load(Ordering::Acquire))
            .count()
    }
}

/// Holds responses back so tests can complete or abandon requests by hand.
pub(crate) struct ManualResponses {
    state: Arc<MockState>,
}

impl ManualResponses {
    pub(crate) fn install(transport: &MockTransport) -> Self {
        transport.state.manual_all.store(true, Ordering::Release);
        ManualResponses {
            state: Arc::clone(&transport.state),
        }
    }

    pub(crate) fn install_for(transport: &MockTransport, address: SocketAddr) -> Self {
        transport
            .state
            .manual_addrs
            .lock()
            .unwrap()
            .insert(address);
        ManualResponses {
            state: Arc::clone(&transport.state),
        }
    }

    /// Completes the oldest held request with the given result.
    pub(crate) fn complete_one(&self, result: Result<Response, RequestError>) {
        let entry = self.state.pending.lock().unwrap().pop_front();
        let (_, _, sink) = entry.expect("no pending request to complete");
        sink(result);
    }

    /// Abandons the oldest held request, as a dying connection would.
    pub(crate) fn drop_one(&self) {
        let entry = self.state.pending.lock().unwrap().pop_front();
        drop(entry.expect("no pending request to drop"));
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.pending.lock().unwrap().len()
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: SocketAddr,
        keyspace: Option<&VerifiedKeyspaceName>,
    ) -> Result<(Arc<dyn Connection>, ErrorReceiver), ConnectError> {
        *self
            .state
            .connect_attempts
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_insert(0) += 1;

        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.state.critical.lock().unwrap().get(&endpoint) {
            return Err(error.clone());
        }
        let refused = {
            let mut counts = self.state.refused_counts.lock().unwrap();
            match counts.get_mut(&endpoint) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => self.state.refused.lock().unwrap().contains(&endpoint),
            }
        };
        if refused {
            return Err(ConnectError::Network(Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }

        let (error_tx, error_rx) = oneshot::channel();
        let connection = Arc::new(MockConnection {
            id: self.state.next_connection_id.fetch_add(1, Ordering::Relaxed),
            address: endpoint,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
            error_tx: Mutex::new(Some(error_tx)),
        });
        if let Some(keyspace) = keyspace {
            self.state
                .keyspace_log
                .lock()
                .unwrap()
                .push((endpoint, keyspace.as_str().to_string()));
        }
        self.state
            .connections
            .lock()
            .unwrap()
            .push(Arc::clone(&connection));
        Ok((connection, error_rx))
    }
}

struct MockConnection {
    id: u64,
    address: SocketAddr,
    state: Arc<MockState>,
    closed: AtomicBool,
    error_tx: Mutex<Option<oneshot::Sender<ConnectionError>>>,
}

impl MockConnection {
    fn kill(&self, error: ConnectionError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sender) = self.error_tx.lock().unwrap().take() {
            let _ = sender.send(error);
        }
        // Abandon everything this connection had in flight.
        self.state
            .pending
            .lock()
            .unwrap()
            .retain(|(id, _, _)| *id != self.id);
    }

    fn is_manual(&self) -> bool {
        self.state.manual_all.load(Ordering::Acquire)
            || self
                .state
                .manual_addrs
                .lock()
                .unwrap()
                .contains(&self.address)
    }

    fn respond(&self, request: &Request) -> Result<Response, RequestError> {
        if let Some(error) = self.state.error_responses.lock().unwrap().get(&self.address) {
            return Err(RequestError::Db(error.clone()));
        }
        Ok(match request {
            Request::Query { statement, .. } => {
                let contents = statement.contents.trim();
                let upper = contents.to_ascii_uppercase();
                if upper.starts_with("CREATE")
                    || upper.starts_with("ALTER")
                    || upper.starts_with("DROP")
                {
                    Response::SchemaChange
                } else if let Some(keyspace) = upper.strip_prefix("USE ") {
                    Response::SetKeyspace(keyspace.trim().to_ascii_lowercase())
                } else {
                    Response::Rows {
                        payload: Bytes::new(),
                        new_metadata_id: None,
                    }
                }
            }
            Request::Execute { .. } => Response::Rows {
                payload: Bytes::new(),
                new_metadata_id: self.state.result_metadata_id.lock().unwrap().clone(),
            },
            Request::Prepare { query } => Response::Prepared(PreparedStatement::new(
                Bytes::copy_from_slice(query.as_bytes()),
                query.clone(),
            )),
            Request::SchemaVersions => {
                Response::SchemaVersions(self.state.schema_versions.lock().unwrap().clone())
            }
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn write(&self, request: Request, sink: ResponseSink) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.state.write_refused.lock().unwrap().contains(&self.address) {
            return false;
        }

        let contents = match &request {
            Request::Query { statement, .. } => statement.contents.clone(),
            Request::Execute { prepared, .. } => format!("EXECUTE {}", prepared.statement),
            Request::Prepare { query } => format!("PREPARE {}", query),
            Request::SchemaVersions => "SCHEMA VERSIONS".to_string(),
        };
        self.state
            .request_log
            .lock()
            .unwrap()
            .push((self.address, contents));

        if self.is_manual() {
            self.state
                .pending
                .lock()
                .unwrap()
                .push_back((self.id, self.address, sink));
        } else {
            sink(self.respond(&request));
        }
        true
    }

    async fn use_keyspace(&self, keyspace: &VerifiedKeyspaceName) -> Result<(), RequestError> {
        self.state
            .keyspace_log
            .lock()
            .unwrap()
            .push((self.address, keyspace.as_str().to_string()));
        Ok(())
    }

    fn close(&self) {
        self.kill(ConnectionError::Closed);
    }
}

/// Pool listener that only records what it saw.
#[derive(Default)]
pub(crate) struct RecordingPoolListener {
    events: Mutex<Vec<(String, SocketAddr)>>,
}

impl RecordingPoolListener {
    pub(crate) fn new() -> Self {
        RecordingPoolListener::default()
    }

    pub(crate) fn events(&self) -> Vec<(String, SocketAddr)> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionPoolListener for RecordingPoolListener {
    fn on_pool_up(&self, address: SocketAddr) {
        self.events.lock().unwrap().push(("up".into(), address));
    }

    fn on_pool_down(&self, address: SocketAddr) {
        self.events.lock().unwrap().push(("down".into(), address));
    }

    fn on_pool_critical_error(&self, address: SocketAddr, _error: ConnectError) {
        self.events.lock().unwrap().push(("critical".into(), address));
    }
}

/// Request listener with no processor behind it.
pub(crate) struct NullRequestListener;

impl NullRequestListener {
    pub(crate) fn new() -> Self {
        NullRequestListener
    }
}

impl RequestListener for NullRequestListener {
    fn on_keyspace_changed(&self, _keyspace: &str) {}

    fn on_result_metadata_changed(&self, _prepared_id: &Bytes, _result_metadata_id: &Bytes) {}

    fn on_wait_for_schema_agreement(
        &self,
        _handler: &Arc<RequestHandler>,
        _coordinator: SocketAddr,
        _response: &Response,
    ) -> bool {
        false
    }

    fn on_prepare_all(
        &self,
        _handler: &Arc<RequestHandler>,
        _coordinator: SocketAddr,
        _response: &Response,
    ) -> bool {
        false
    }

    fn on_is_host_up(&self, _address: SocketAddr) -> bool {
        true
    }
}

/// Deterministic plan order for handler tests.
#[derive(Debug)]
pub(crate) struct FixedOrderPolicy {
    hosts: Vec<Arc<Host>>,
}

impl FixedOrderPolicy {
    pub(crate) fn new(hosts: Vec<Arc<Host>>) -> Self {
        FixedOrderPolicy { hosts }
    }
}

impl LoadBalancingPolicy for FixedOrderPolicy {
    fn init(&self, _current_host: Option<&Arc<Host>>, _hosts: &HostMap) {}

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(
        &self,
        _keyspace: Option<&str>,
        _request: &Request,
        _token_map: Option<&Arc<dyn TokenMap>>,
    ) -> QueryPlan {
        Box::new(self.hosts.clone().into_iter())
    }

    fn on_add(&self, _host: &Arc<Host>) {}
    fn on_up(&self, _host: &Arc<Host>) {}
    fn on_down(&self, _host: &Arc<Host>) {}
    fn on_remove(&self, _host: &Arc<Host>) {}

    fn name(&self) -> String {
        "FixedOrderPolicy".to_string()
    }
}

pub(crate) fn test_address(last_octet: u8) -> SocketAddr {
    format!("127.0.0.{}:9042", last_octet).parse().unwrap()
}

pub(crate) fn test_pool_settings(transport: &MockTransport, n: usize) -> Arc<PoolSettings> {
    Arc::new(PoolSettings {
        num_connections_per_host: NonZeroUsize::new(n).unwrap(),
        connector: transport.connector(),
        reconnection_policy: Arc::new(ExponentialReconnectionPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
        )),
        metrics: Arc::new(Metrics::new()),
    })
}

/// Everything a `RequestHandler` needs to run without a processor.
pub(crate) struct HandlerRig {
    pub(crate) manager: Arc<ConnectionPoolManager>,
    profile: ExecutionProfile,
    timestamp_generator: Arc<dyn TimestampGenerator>,
    listener: Arc<dyn RequestListener>,
    metrics: Arc<Metrics>,
}

pub(crate) async fn handler_test_rig(
    transport: &MockTransport,
    octets: &[u8],
    profile: ExecutionProfile,
) -> HandlerRig {
    let hosts: Vec<Arc<Host>> = octets
        .iter()
        .map(|octet| {
            let host = Arc::new(Host::new(test_address(*octet)));
            host.set_up();
            host
        })
        .collect();
    let addresses: Vec<SocketAddr> = hosts.iter().map(|host| host.address).collect();

    let (manager, failures) = ConnectionPoolManager::connect(
        test_pool_settings(transport, 1),
        Arc::new(RecordingPoolListener::new()),
        None,
        addresses,
    )
    .await;
    assert!(failures.is_empty(), "rig hosts must connect: {:?}", failures);

    let profile = profile
        .to_builder()
        .load_balancing_policy(Arc::new(FixedOrderPolicy::new(hosts)))
        .build();

    HandlerRig {
        manager,
        profile,
        timestamp_generator: Arc::new(MonotonicTimestampGenerator::new()),
        listener: Arc::new(NullRequestListener::new()),
        metrics: Arc::new(Metrics::new()),
    }
}

impl HandlerRig {
    pub(crate) fn address(&self, last_octet: u8) -> SocketAddr {
        test_address(last_octet)
    }

    pub(crate) fn run(&self, handler: &Arc<RequestHandler>) {
        handler.init(
            self.profile.clone(),
            Arc::clone(&self.manager),
            None,
            &self.timestamp_generator,
            Arc::clone(&self.listener),
            Arc::clone(&self.metrics),
        );
        handler.execute();
    }
}

/// A connected processor over mock hosts, plus the queue feeding it.
pub(crate) struct ProcessorRig {
    pub(crate) processor: RequestProcessor,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) num_connections: usize,
    _session_events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub(crate) async fn processor_test_rig(transport: &MockTransport, octets: &[u8]) -> ProcessorRig {
    let hosts: HostMap = octets
        .iter()
        .map(|octet| {
            let address = test_address(*octet);
            (address, Arc::new(Host::new(address)))
        })
        .collect();
    let current_host = hosts
        .values()
        .next()
        .cloned()
        .expect("processor rig needs at least one host");

    let queue = Arc::new(RequestQueue::with_capacity(64));
    let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
    let num_connections = 2;

    let settings = ProcessorSettings {
        pool_settings: test_pool_settings(transport, num_connections),
        default_profile: ExecutionProfile::builder().build(),
        profiles: HashMap::new(),
        timestamp_generator: Arc::new(MonotonicTimestampGenerator::new()),
        request_queue: Arc::clone(&queue),
        token_map: None,
        prepare_on_all_hosts: true,
        max_schema_wait_time: Duration::from_secs(10),
        schema_agreement_interval: Duration::from_millis(200),
        down_host_on_critical_error: true,
        session_events: session_events_tx,
    };

    let processor = RequestProcessor::connect(settings, &current_host, &hosts, None)
        .await
        .expect("processor rig must connect");

    ProcessorRig {
        processor,
        queue,
        num_connections,
        _session_events: session_events_rx,
    }
}

/// Scripted control connection: a fixed initial topology plus a handle for
/// pushing events later.
pub(crate) struct MockControl {
    octets: Vec<u8>,
    connect_error: Mutex<Option<ConnectError>>,
    events_tx: Mutex<Option<mpsc::Sender<ControlEvent>>>,
}

impl MockControl {
    pub(crate) fn new(octets: &[u8]) -> Arc<Self> {
        Arc::new(MockControl {
            octets: octets.to_vec(),
            connect_error: Mutex::new(None),
            events_tx: Mutex::new(None),
        })
    }

    pub(crate) fn fail_connects_with(&self, error: ConnectError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    /// Pushes a topology/schema event into the connected session.
    pub(crate) async fn push_event(&self, event: ControlEvent) {
        let sender = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("control connection not established");
        sender.send(event).await.expect("session worker is gone");
    }
}

#[async_trait]
impl ControlConnector for MockControl {
    async fn connect(
        &self,
        _contact_points: &[SocketAddr],
    ) -> Result<ControlHandle, ConnectError> {
        if let Some(error) = self.connect_error.lock().unwrap().clone() {
            return Err(error);
        }

        let hosts: HostMap = self
            .octets
            .iter()
            .map(|octet| {
                let address = test_address(*octet);
                (address, Arc::new(Host::new(address)))
            })
            .collect();
        let connected_host = hosts
            .values()
            .next()
            .cloned()
            .expect("mock control needs at least one host");

        let (events_tx, events_rx) = mpsc::channel(32);
        *self.events_tx.lock().unwrap() = Some(events_tx);

        Ok(ControlHandle {
            connected_host,
            hosts,
            events: events_rx,
        })
    }
}
