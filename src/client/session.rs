//! The session: the entry point of the dispatch core.
//!
//! A session is created closed, connects to a cluster, accepts `execute` /
//! `prepare` calls while connected, and closes irrevocably. Internally it
//! owns the control-connection worker, the process-wide host map, the bounded
//! request queue and the request processor manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::config::SessionConfig;
use crate::cluster::control::{ControlEvent, ControlHandle};
use crate::cluster::host::{resolve_contact_points, Host, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{CloseError, ExecutionError, NewSessionError};
use crate::execution::processor::{ProcessorSettings, SessionEvent};
use crate::execution::processor_manager::RequestProcessorManager;
use crate::execution::request_handler::RequestHandler;
use crate::execution::request_queue::RequestQueue;
use crate::execution::QueryResponse;
use crate::network::connection_pool::PoolSettings;
use crate::network::transport::{Request, Response, VerifiedKeyspaceName};
use crate::observability::metrics::Metrics;
use crate::statement::{Consistency, PreparedStatement, Statement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

// Everything that only exists while the session is connected.
struct SessionRuntime {
    request_queue: Arc<RequestQueue>,
    processor_manager: Arc<RequestProcessorManager>,
    _control_worker: RemoteHandle<()>,
}

/// A handle to a cluster: connection pools over every reachable node plus the
/// request dispatch machinery feeding them.
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    metrics: Arc<Metrics>,
    // Process-wide host map; written by the session worker, read anywhere.
    hosts: Arc<Mutex<HostMap>>,
    prepared_metadata: Arc<Mutex<HashMap<Bytes, Bytes>>>,
    runtime: ArcSwapOption<SessionRuntime>,
}

impl Session {
    /// Creates a closed session. Call [`connect`](Session::connect) before
    /// executing requests.
    pub fn new(config: SessionConfig) -> Self {
        Session {
            config,
            state: Mutex::new(SessionState::Closed),
            metrics: Arc::new(Metrics::new()),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            prepared_metadata: Arc::new(Mutex::new(HashMap::new())),
            runtime: ArcSwapOption::empty(),
        }
    }

    /// Connects to the cluster: resolves contact points, establishes the
    /// control connection and builds the request processors with their
    /// connection pools. Fails fast if the session is not closed.
    pub async fn connect(&self, keyspace: Option<&str>) -> Result<(), NewSessionError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Closed {
                return Err(NewSessionError::UnableToConnect);
            }
            *state = SessionState::Connecting;
        }

        let keyspace = match keyspace.map(VerifiedKeyspaceName::new).transpose() {
            Ok(keyspace) => keyspace,
            Err(error) => {
                *self.state.lock().unwrap() = SessionState::Closed;
                return Err(error.into());
            }
        };

        match self.internal_connect(keyspace).await {
            Ok(runtime) => {
                self.runtime.store(Some(Arc::new(runtime)));
                *self.state.lock().unwrap() = SessionState::Connected;
                Ok(())
            }
            Err(error) => {
                self.hosts.lock().unwrap().clear();
                *self.state.lock().unwrap() = SessionState::Closed;
                Err(error)
            }
        }
    }

    async fn internal_connect(
        &self,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Result<SessionRuntime, NewSessionError> {
        if self.config.contact_points.is_empty() {
            return Err(NewSessionError::EmptyContactPoints);
        }
        let (resolved, failed_hostnames) = resolve_contact_points(
            &self.config.contact_points,
            self.config.hostname_resolution_timeout,
        )
        .await;
        if resolved.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(
                failed_hostnames,
            ));
        }

        // Contact-point hosts are provisional until the control connection
        // reports the authoritative topology; the mark survives only on hosts
        // the cluster did not confirm.
        {
            let mut hosts = self.hosts.lock().unwrap();
            hosts.clear();
            for address in &resolved {
                let host = Arc::new(Host::new(*address));
                host.set_mark(true);
                hosts.insert(*address, host);
            }
        }

        let ControlHandle {
            connected_host,
            hosts: discovered,
            events,
        } = self.config.control.connect(&resolved).await?;

        let hosts_snapshot = {
            let mut hosts = self.hosts.lock().unwrap();
            for (address, host) in &discovered {
                match hosts.get(address) {
                    Some(existing) => existing.set_mark(false),
                    None => {
                        host.set_mark(false);
                        hosts.insert(*address, Arc::clone(host));
                    }
                }
            }
            let purged: Vec<_> = hosts
                .values()
                .filter(|host| host.is_marked())
                .map(|host| host.address)
                .collect();
            for address in purged {
                debug!("[{}] Contact point not part of the cluster, purged", address);
                hosts.remove(&address);
            }
            hosts
                .entry(connected_host.address)
                .or_insert_with(|| Arc::clone(&connected_host));
            hosts.clone()
        };

        if let Some(token_map) = &self.config.token_map {
            for host in hosts_snapshot.values() {
                token_map.add_host(host);
            }
            token_map.build();
        }

        let request_queue = Arc::new(RequestQueue::with_capacity(self.config.request_queue_size));
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();

        let pool_settings = Arc::new(PoolSettings {
            num_connections_per_host: self.config.num_connections_per_host,
            connector: Arc::clone(&self.config.connector),
            reconnection_policy: Arc::clone(&self.config.reconnection_policy),
            metrics: Arc::clone(&self.metrics),
        });
        let settings = ProcessorSettings {
            pool_settings,
            default_profile: self.config.default_execution_profile.clone(),
            profiles: self.config.execution_profiles.clone(),
            timestamp_generator: Arc::clone(&self.config.timestamp_generator),
            request_queue: Arc::clone(&request_queue),
            token_map: self.config.token_map.clone(),
            prepare_on_all_hosts: self.config.prepare_on_all_hosts,
            max_schema_wait_time: self.config.max_schema_wait_time,
            schema_agreement_interval: self.config.schema_agreement_interval,
            down_host_on_critical_error: self.config.down_host_on_critical_error,
            session_events: session_events_tx,
        };

        let current_host = hosts_snapshot
            .get(&connected_host.address)
            .cloned()
            .unwrap_or(connected_host);
        let processor_manager = Arc::new(
            RequestProcessorManager::connect(
                self.config.request_processor_count.get(),
                settings,
                &current_host,
                &hosts_snapshot,
                keyspace,
            )
            .await?,
        );

        let worker = ControlWorker {
            control_events: events,
            session_events: session_events_rx,
            processor_manager: Arc::clone(&processor_manager),
            hosts: Arc::clone(&self.hosts),
            token_map: self.config.token_map.clone(),
            prepared_metadata: Arc::clone(&self.prepared_metadata),
        };
        let (fut, control_worker) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(SessionRuntime {
            request_queue,
            processor_manager,
            _control_worker: control_worker,
        })
    }

    /// Executes an unprepared statement.
    pub async fn execute(&self, statement: Statement) -> Result<QueryResponse, ExecutionError> {
        let profile_name = statement.execution_profile_name.clone();
        let is_idempotent = statement.is_idempotent;
        let request = Request::Query {
            statement,
            consistency: Consistency::default(),
            timestamp: None,
        };
        self.dispatch(request, profile_name, is_idempotent).await
    }

    /// Executes a previously prepared statement.
    pub async fn execute_prepared(
        &self,
        prepared: &PreparedStatement,
        values: Bytes,
    ) -> Result<QueryResponse, ExecutionError> {
        let request = Request::Execute {
            prepared: prepared.clone(),
            values,
            consistency: Consistency::default(),
            timestamp: None,
        };
        self.dispatch(request, None, false).await
    }

    /// Prepares a statement on the cluster. With `prepare_on_all_hosts` set,
    /// the preparation is propagated to every available host before the
    /// returned future resolves.
    pub async fn prepare(&self, query: &str) -> Result<PreparedStatement, ExecutionError> {
        let response = self
            .dispatch(
                Request::Prepare {
                    query: query.to_string(),
                },
                None,
                false,
            )
            .await?;
        match response.response {
            Response::Prepared(prepared) => Ok(prepared),
            _ => Err(ExecutionError::UnexpectedResponse),
        }
    }

    async fn dispatch(
        &self,
        request: Request,
        profile_name: Option<String>,
        is_idempotent: bool,
    ) -> Result<QueryResponse, ExecutionError> {
        if *self.state.lock().unwrap() != SessionState::Connected {
            return Err(ExecutionError::NoHostsAvailable);
        }
        let Some(runtime) = self.runtime.load_full() else {
            return Err(ExecutionError::NoHostsAvailable);
        };

        let (handler, future) = RequestHandler::new(request, profile_name, is_idempotent);
        if runtime.request_queue.enqueue(handler).is_err() {
            self.metrics.inc_queue_full_errors();
            return Err(ExecutionError::RequestQueueFull);
        }
        runtime.processor_manager.notify_request_async();

        future.await.unwrap_or(Err(ExecutionError::NoHostsAvailable))
    }

    /// Closes the session: drains the pools, stops the processors and the
    /// control worker. Irreversible; a closing session rejects everything.
    pub async fn close(&self) -> Result<(), CloseError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Connected {
                return Err(CloseError::UnableToClose);
            }
            *state = SessionState::Closing;
        }

        if let Some(runtime) = self.runtime.swap(None) {
            runtime.processor_manager.close().await;
            runtime.processor_manager.close_handles().await;
            // Dropping the runtime takes the control worker with it.
        }
        self.hosts.lock().unwrap().clear();
        *self.state.lock().unwrap() = SessionState::Closed;
        debug!("Session closed");
        Ok(())
    }

    /// Metrics collected by this session.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Latest server-reported result metadata id for a prepared statement.
    pub fn prepared_result_metadata(&self, prepared_id: &Bytes) -> Option<Bytes> {
        self.prepared_metadata
            .lock()
            .unwrap()
            .get(prepared_id)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn runtime_processor_manager(&self) -> Option<Arc<RequestProcessorManager>> {
        self.runtime
            .load_full()
            .map(|runtime| Arc::clone(&runtime.processor_manager))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.lock().unwrap())
            .field("hosts", &self.hosts.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

// Consumes control-connection events and processor-originated session events,
// and broadcasts the consequences to every processor.
struct ControlWorker {
    control_events: mpsc::Receiver<ControlEvent>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    processor_manager: Arc<RequestProcessorManager>,
    hosts: Arc<Mutex<HostMap>>,
    token_map: Option<Arc<dyn TokenMap>>,
    prepared_metadata: Arc<Mutex<HashMap<Bytes, Bytes>>>,
}

impl ControlWorker {
    async fn work(mut self) {
        loop {
            tokio::select! {
                event = self.control_events.recv() => {
                    match event {
                        Some(event) => self.handle_control_event(event),
                        // The control connection is gone for good.
                        None => break,
                    }
                }
                event = self.session_events.recv() => {
                    match event {
                        Some(event) => self.handle_session_event(event),
                        None => break,
                    }
                }
            }
        }
        debug!("Session control worker stopped");
    }

    fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Up(address) => {
                if let Some(host) = self.hosts.lock().unwrap().get(&address) {
                    host.set_up();
                }
                self.processor_manager.notify_host_up_async(address);
            }
            ControlEvent::Down(address) => {
                if let Some(host) = self.hosts.lock().unwrap().get(&address) {
                    host.set_down();
                }
                self.processor_manager.notify_host_down_async(address);
            }
            ControlEvent::Add(host) => {
                self.hosts
                    .lock()
                    .unwrap()
                    .entry(host.address)
                    .or_insert_with(|| Arc::clone(&host));
                if let Some(token_map) = &self.token_map {
                    token_map.add_host(&host);
                    token_map.build();
                }
                self.processor_manager.notify_host_add_async(&host);
                self.broadcast_token_map();
            }
            ControlEvent::Remove(address) => {
                let removed = self.hosts.lock().unwrap().remove(&address);
                let Some(host) = removed else {
                    debug!("[{}] Removal of an unknown host, ignored", address);
                    return;
                };
                if let Some(token_map) = &self.token_map {
                    token_map.remove_host_and_build(&host);
                }
                self.processor_manager.notify_host_remove_async(&host);
                self.broadcast_token_map();
            }
            ControlEvent::KeyspaceChanged(name) => self.keyspace_update(&name),
            ControlEvent::Error { message } => {
                warn!("Control connection error: {}", message);
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::KeyspaceChanged(name) => self.keyspace_update(&name),
            SessionEvent::PreparedMetadataChanged {
                prepared_id,
                result_metadata_id,
            } => {
                self.prepared_metadata
                    .lock()
                    .unwrap()
                    .insert(prepared_id, result_metadata_id);
            }
        }
    }

    fn keyspace_update(&self, name: &str) {
        match VerifiedKeyspaceName::new(name) {
            Ok(keyspace) => self.processor_manager.keyspace_update(&keyspace),
            Err(error) => warn!("Ignoring invalid keyspace name {:?}: {}", name, error),
        }
    }

    fn broadcast_token_map(&self) {
        if let Some(token_map) = &self.token_map {
            self.processor_manager
                .notify_token_map_update_async(token_map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::KnownNode;
    use crate::errors::ConnectError;
    use crate::utils::test_utils::{setup_tracing, test_address, MockControl, MockTransport};
    use assert_matches::assert_matches;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    struct TestCluster {
        transport: MockTransport,
        control: Arc<MockControl>,
        session: Session,
    }

    fn cluster(octets: &[u8]) -> TestCluster {
        cluster_with(octets, |_| {})
    }

    fn cluster_with(octets: &[u8], tweak: impl FnOnce(&mut SessionConfig)) -> TestCluster {
        setup_tracing();
        let transport = MockTransport::new();
        let control = MockControl::new(octets);
        let mut config = SessionConfig::new(transport.connector(), control.clone());
        for octet in octets {
            config
                .contact_points
                .push(KnownNode::Address(test_address(*octet)));
        }
        config.num_connections_per_host = NonZeroUsize::new(1).unwrap();
        tweak(&mut config);
        let session = Session::new(config);
        TestCluster {
            transport,
            control,
            session,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_host_round_trip() {
        let cluster = cluster(&[1]);
        cluster.session.connect(None).await.unwrap();

        let response = cluster
            .session
            .execute(Statement::new("SELECT 1"))
            .await
            .unwrap();
        assert_eq!(response.coordinator, test_address(1));
        assert_matches!(response.response, Response::Rows { .. });
        assert_eq!(cluster.session.metrics().get_requests_num(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_fails_fast_when_not_connected() {
        let cluster = cluster(&[1]);
        assert_matches!(
            cluster.session.execute(Statement::new("SELECT 1")).await,
            Err(ExecutionError::NoHostsAvailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn control_connection_failure_fails_connect() {
        let cluster = cluster(&[1]);
        cluster
            .control
            .fail_connects_with(ConnectError::Timeout);

        assert_matches!(
            cluster.session.connect(None).await,
            Err(NewSessionError::ControlConnection(ConnectError::Timeout))
        );
        // The failed attempt leaves the session closed and reusable.
        assert_matches!(
            cluster.session.execute(Statement::new("SELECT 1")).await,
            Err(ExecutionError::NoHostsAvailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn double_connect_is_rejected() {
        let cluster = cluster(&[1]);
        cluster.session.connect(None).await.unwrap();
        assert_matches!(
            cluster.session.connect(None).await,
            Err(NewSessionError::UnableToConnect)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_of_a_closed_session_is_rejected() {
        let cluster = cluster(&[1]);
        assert_matches!(cluster.session.close().await, Err(CloseError::UnableToClose));

        cluster.session.connect(None).await.unwrap();
        cluster.session.close().await.unwrap();
        assert_matches!(cluster.session.close().await, Err(CloseError::UnableToClose));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_backpressure_reports_queue_full() {
        let cluster = cluster_with(&[1], |config| {
            config.request_queue_size = 4;
        });
        cluster.session.connect(None).await.unwrap();

        // On a current-thread runtime the five dispatches below all enqueue
        // before the processor task gets a chance to drain.
        let futures: Vec<_> = (0..5)
            .map(|i| cluster.session.execute(Statement::new(format!("SELECT {}", i))))
            .collect();
        let results = futures::future::join_all(futures).await;

        let full: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, result)| {
                matches!(result, Err(ExecutionError::RequestQueueFull))
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(full, vec![4], "exactly the fifth request is rejected");
        for (i, result) in results.iter().enumerate().take(4) {
            assert_matches!(result, Ok(_), "request {} should drain", i);
        }
        assert_eq!(cluster.session.metrics().get_queue_full_errors(), 1);

        // The first four drained in order.
        let selects: Vec<String> = cluster
            .transport
            .request_log()
            .into_iter()
            .filter(|contents| contents.starts_with("SELECT"))
            .collect();
        assert_eq!(selects, ["SELECT 0", "SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_keyspace_error_fails_connect() {
        let cluster = cluster(&[1, 2]);
        cluster
            .transport
            .fail_critically(test_address(1), ConnectError::Keyspace("nope".into()));
        cluster
            .transport
            .fail_critically(test_address(2), ConnectError::Keyspace("nope".into()));

        let result = cluster.session.connect(Some("nope")).await;
        assert_matches!(
            result,
            Err(NewSessionError::UnableToSetKeyspace(name)) if name == "nope"
        );

        // All pools are gone and nothing keeps reconnecting.
        let attempts_before = cluster.transport.connect_attempts(test_address(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            cluster.transport.connect_attempts(test_address(1)),
            attempts_before
        );
        assert_eq!(cluster.transport.live_connection_count(), 0);

        // The session fell back to closed; executes fail fast.
        assert_matches!(
            cluster.session.execute(Statement::new("SELECT 1")).await,
            Err(ExecutionError::NoHostsAvailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn topology_addition_reaches_every_processor() {
        let cluster = cluster_with(&[1, 2], |config| {
            config.request_processor_count = NonZeroUsize::new(2).unwrap();
        });
        cluster.session.connect(None).await.unwrap();

        let newcomer = Arc::new(Host::new(test_address(3)));
        cluster
            .control
            .push_event(ControlEvent::Add(Arc::clone(&newcomer)))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Each of the two processors built its own pool for the new host.
        assert_eq!(cluster.transport.connect_attempts(test_address(3)), 2);
        let manager = cluster.session.runtime_processor_manager().unwrap();
        for processor in manager.processors() {
            assert!(processor
                .pool_manager()
                .find_least_busy(test_address(3))
                .is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn host_removal_notifies_processors() {
        let cluster = cluster(&[1, 2]);
        cluster.session.connect(None).await.unwrap();

        cluster
            .control
            .push_event(ControlEvent::Remove(test_address(2)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The removed host no longer appears in query plans; every request
        // lands on the survivor.
        for _ in 0..4 {
            let response = cluster
                .session
                .execute(Statement::new("SELECT 1"))
                .await
                .unwrap();
            assert_eq!(response.coordinator, test_address(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_fans_out_to_all_available_hosts() {
        let cluster = cluster(&[1, 2, 3]);
        cluster.session.connect(None).await.unwrap();

        let prepared = cluster.session.prepare("SELECT a FROM t WHERE k = ?").await.unwrap();
        assert_eq!(prepared.statement, "SELECT a FROM t WHERE k = ?");

        // One PREPARE on the coordinator plus one per remaining host.
        let prepares: Vec<String> = cluster
            .transport
            .request_log()
            .into_iter()
            .filter(|contents| contents.starts_with("PREPARE"))
            .collect();
        assert_eq!(prepares.len(), 3);
        for octet in [1, 2, 3] {
            assert_eq!(
                cluster
                    .transport
                    .requests_at(test_address(octet))
                    .iter()
                    .filter(|contents| contents.starts_with("PREPARE"))
                    .count(),
                1,
                "host {} should see exactly one PREPARE",
                octet
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_fan_out_tolerates_unwritable_hosts() {
        let cluster = cluster(&[1, 2, 3]);
        cluster.session.connect(None).await.unwrap();
        // Writes to host 3 are refused; its fan-out callback completes the
        // countdown on drop.
        cluster.transport.refuse_writes(test_address(3));

        // The coordinator attempt skips past the refused host if the plan
        // starts there; the fan-out to it completes the countdown on drop.
        let prepared = cluster.session.prepare("SELECT 1").await;
        assert_matches!(prepared, Ok(_));
    }

    #[tokio::test(start_paused = true)]
    async fn ddl_waits_for_schema_agreement() {
        let cluster = cluster(&[1]);
        cluster.session.connect(None).await.unwrap();

        let response = cluster
            .session
            .execute(Statement::new("CREATE TABLE ks.t (k int PRIMARY KEY)"))
            .await
            .unwrap();
        assert_matches!(response.response, Response::SchemaChange);

        // The schema version poll went out before the future resolved.
        assert!(cluster
            .transport
            .request_log()
            .iter()
            .any(|contents| contents == "SCHEMA VERSIONS"));
    }

    #[tokio::test(start_paused = true)]
    async fn schema_disagreement_resolves_after_the_wait_cap() {
        let cluster = cluster_with(&[1], |config| {
            config.max_schema_wait_time = Duration::from_secs(2);
        });
        cluster.session.connect(None).await.unwrap();
        cluster
            .transport
            .set_schema_versions(vec![uuid::Uuid::new_v4(), uuid::Uuid::new_v4()]);

        let started = tokio::time::Instant::now();
        let response = cluster
            .session
            .execute(Statement::new("DROP TABLE ks.t"))
            .await
            .unwrap();
        assert_matches!(response.response, Response::SchemaChange);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn use_statement_propagates_the_keyspace() {
        let cluster = cluster(&[1, 2]);
        cluster.session.connect(None).await.unwrap();

        let response = cluster
            .session
            .execute(Statement::new("USE ks1"))
            .await
            .unwrap();
        assert_matches!(response.response, Response::SetKeyspace(ref name) if name == "ks1");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Both hosts' connections switched.
        assert_eq!(cluster.transport.keyspace_switches("ks1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_close_completes_every_future() {
        let cluster = cluster_with(&[1], |config| {
            config.request_queue_size = 2048;
        });
        cluster.session.connect(None).await.unwrap();

        let futures: Vec<_> = (0..100)
            .map(|_| cluster.session.execute(Statement::new("SELECT 1")))
            .collect();
        let all = futures::future::join_all(futures);
        let close = cluster.session.close();
        let (results, close_result) = tokio::join!(all, close);

        close_result.unwrap();
        for result in results {
            match result {
                Ok(_) | Err(ExecutionError::NoHostsAvailable) => {}
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(cluster.transport.live_connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn result_metadata_updates_are_cached() {
        let cluster = cluster(&[1]);
        cluster.session.connect(None).await.unwrap();

        let prepared = cluster.session.prepare("SELECT v FROM t").await.unwrap();
        let new_id = Bytes::from_static(b"metadata-v2");
        cluster.transport.set_result_metadata_id(Some(new_id.clone()));

        cluster
            .session
            .execute_prepared(&prepared, Bytes::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            cluster.session.prepared_result_metadata(&prepared.id),
            Some(new_id)
        );
    }
}
