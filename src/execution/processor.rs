//! The request processor: an event-loop worker that drains the shared
//! request queue, hands each request its execution context, and absorbs
//! topology and pool events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::host::{Host, HostDistance, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{ConnectError, ExecutionError, NewSessionError};
use crate::execution::request_handler::RequestHandler;
use crate::execution::request_queue::RequestQueue;
use crate::execution::{prepare_all, schema_agreement, RequestListener};
use crate::network::connection_pool::PoolSettings;
use crate::network::pool_manager::{ConnectionPoolListener, ConnectionPoolManager};
use crate::network::transport::{Response, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::timestamp_generator::TimestampGenerator;

// The flush loop caps itself at this share of its event loop's time, so
// connection I/O and timers interleaved on the same runtime keep making
// progress under sustained load.
const FLUSH_RATIO: u128 = 90;

/// Computes how long to stay off the queue after a flush that took
/// `flush_time`. `None` means the next flush may run immediately.
pub(crate) fn processing_delay(flush_time: Duration) -> Option<Duration> {
    let idle_ns = flush_time.as_nanos() * (100 - FLUSH_RATIO) / FLUSH_RATIO;
    if idle_ns >= 1_000_000 {
        // Round to the nearest millisecond, the timer's resolution.
        Some(Duration::from_millis(((idle_ns + 500_000) / 1_000_000) as u64))
    } else {
        None
    }
}

/// Events forwarded from the processors to the session.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    KeyspaceChanged(String),
    PreparedMetadataChanged {
        prepared_id: Bytes,
        result_metadata_id: Bytes,
    },
}

/// Everything a processor needs at construction, shared by all processors of
/// one session.
#[derive(Clone)]
pub(crate) struct ProcessorSettings {
    pub(crate) pool_settings: Arc<PoolSettings>,
    pub(crate) default_profile: ExecutionProfile,
    pub(crate) profiles: HashMap<String, ExecutionProfile>,
    pub(crate) timestamp_generator: Arc<dyn TimestampGenerator>,
    pub(crate) request_queue: Arc<RequestQueue>,
    pub(crate) token_map: Option<Arc<dyn TokenMap>>,
    pub(crate) prepare_on_all_hosts: bool,
    pub(crate) max_schema_wait_time: Duration,
    pub(crate) schema_agreement_interval: Duration,
    pub(crate) down_host_on_critical_error: bool,
    pub(crate) session_events: mpsc::UnboundedSender<SessionEvent>,
}

enum ProcessorCommand {
    HostUp(SocketAddr),
    HostDown(SocketAddr),
    HostAdd(Arc<Host>),
    HostRemove(Arc<Host>),
    TokenMapUpdate(Arc<dyn TokenMap>),
    PoolCriticalError(SocketAddr, ConnectError),
}

struct ProcessorInner {
    settings: ProcessorSettings,
    pool_manager: Arc<ConnectionPoolManager>,
    // Per-processor view of the topology, written only from the worker.
    hosts: RwLock<HostMap>,
    token_map: RwLock<Option<Arc<dyn TokenMap>>>,
    policies: Vec<Arc<dyn LoadBalancingPolicy>>,
    // The wakeup signal standing in for a reactor async handle.
    notify: Notify,
    is_flushing: AtomicBool,
    is_closing: AtomicBool,
    command_tx: mpsc::UnboundedSender<ProcessorCommand>,
}

/// One event-loop worker consuming the shared request queue.
pub(crate) struct RequestProcessor {
    inner: Arc<ProcessorInner>,
    worker_handle: Mutex<Option<RemoteHandle<()>>>,
}

impl RequestProcessor {
    /// Builds the processor's pool manager over the given hosts, initializes
    /// the load balancing policies and starts the worker.
    ///
    /// Hosts that fail to connect for transient reasons are dropped from this
    /// processor's view; a missing keyspace fails the whole session, and an
    /// empty surviving host set fails it too.
    pub(crate) async fn connect(
        settings: ProcessorSettings,
        current_host: &Arc<Host>,
        hosts: &HostMap,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Result<RequestProcessor, NewSessionError> {
        let mut policies: Vec<Arc<dyn LoadBalancingPolicy>> =
            vec![settings.default_profile.load_balancing_policy()];
        for profile in settings.profiles.values() {
            let policy = profile.load_balancing_policy();
            if !policies.iter().any(|known| Arc::ptr_eq(known, &policy)) {
                policies.push(policy);
            }
        }
        for policy in &policies {
            policy.init(Some(current_host), hosts);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let pool_listener = Arc::new(PoolEventForwarder {
            command_tx: command_tx.clone(),
        });

        let addresses: Vec<SocketAddr> = hosts.keys().copied().collect();
        let (pool_manager, failures) = ConnectionPoolManager::connect(
            Arc::clone(&settings.pool_settings),
            pool_listener,
            keyspace.clone(),
            addresses,
        )
        .await;

        let mut hosts = hosts.clone();
        for failure in failures {
            if failure.error.is_keyspace_error() {
                pool_manager.close();
                pool_manager.await_closed().await;
                let name = keyspace
                    .as_ref()
                    .map(|name| name.as_str().to_string())
                    .unwrap_or_default();
                return Err(NewSessionError::UnableToSetKeyspace(name));
            }
            warn!(
                "[{}] Unable to connect during session initialization: {}",
                failure.address, failure.error
            );
            hosts.remove(&failure.address);
        }
        if hosts.is_empty() {
            pool_manager.close();
            pool_manager.await_closed().await;
            return Err(NewSessionError::NoHostsAvailable);
        }
        for host in hosts.values() {
            host.set_up();
        }

        let initial_token_map = settings.token_map.clone();
        let inner = Arc::new(ProcessorInner {
            settings,
            pool_manager,
            hosts: RwLock::new(hosts),
            token_map: RwLock::new(initial_token_map),
            policies,
            notify: Notify::new(),
            is_flushing: AtomicBool::new(false),
            is_closing: AtomicBool::new(false),
            command_tx,
        });

        let worker = ProcessorWorker {
            inner: Arc::clone(&inner),
            command_rx,
            flush_deadline: Instant::now(),
            timer_armed: false,
        };
        let (fut, worker_handle) = worker.run().remote_handle();
        tokio::spawn(fut);

        Ok(RequestProcessor {
            inner,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// Signals that new requests are queued. Elided while a flush chain is
    /// already running; the flush's own queue recheck keeps the chain alive.
    pub(crate) fn notify_request_async(&self) {
        if !self.inner.is_flushing.load(Ordering::Acquire) {
            self.inner.notify.notify_one();
        }
    }

    pub(crate) fn notify_host_add_async(&self, host: Arc<Host>) {
        let _ = self.inner.command_tx.send(ProcessorCommand::HostAdd(host));
    }

    pub(crate) fn notify_host_remove_async(&self, host: Arc<Host>) {
        let _ = self
            .inner
            .command_tx
            .send(ProcessorCommand::HostRemove(host));
    }

    pub(crate) fn notify_host_up_async(&self, address: SocketAddr) {
        let _ = self.inner.command_tx.send(ProcessorCommand::HostUp(address));
    }

    pub(crate) fn notify_host_down_async(&self, address: SocketAddr) {
        let _ = self
            .inner
            .command_tx
            .send(ProcessorCommand::HostDown(address));
    }

    pub(crate) fn notify_token_map_update_async(&self, token_map: Arc<dyn TokenMap>) {
        let _ = self
            .inner
            .command_tx
            .send(ProcessorCommand::TokenMapUpdate(token_map));
    }

    /// Applies a keyspace change to this processor's pool manager.
    pub(crate) fn keyspace_update(&self, keyspace: VerifiedKeyspaceName) {
        self.inner.pool_manager.set_keyspace(keyspace);
    }

    /// Closes the processor's pools and waits until they are gone.
    pub(crate) async fn close(&self) {
        self.inner.pool_manager.close();
        self.inner.pool_manager.await_closed().await;
    }

    /// Stops the worker after one final queue drain. Must follow `close`.
    pub(crate) async fn close_handles(&self) {
        self.inner.pool_manager.close_handles();
        self.inner.is_closing.store(true, Ordering::Release);
        self.inner.notify.notify_one();
        let handle = self.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.inner.pool_manager
    }

    #[cfg(test)]
    pub(crate) fn set_flushing_for_test(&self, flushing: bool) {
        self.inner.is_flushing.store(flushing, Ordering::Release);
    }
}

impl std::fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("is_flushing", &self.inner.is_flushing)
            .field("is_closing", &self.inner.is_closing)
            .finish_non_exhaustive()
    }
}

struct ProcessorWorker {
    inner: Arc<ProcessorInner>,
    command_rx: mpsc::UnboundedReceiver<ProcessorCommand>,
    flush_deadline: Instant,
    timer_armed: bool,
}

impl ProcessorWorker {
    async fn run(mut self) {
        debug!("Started request processor worker");
        loop {
            tokio::select! {
                _ = self.inner.notify.notified() => {
                    if self.flush() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(self.flush_deadline), if self.timer_armed => {
                    self.timer_armed = false;
                    if self.flush() {
                        break;
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        // Channel closed means the processor was dropped.
                        None => break,
                    }
                }
            }
        }
        debug!("Request processor worker stopped");
    }

    /// Drains the queue, then decides whether to keep the flush chain alive.
    ///
    /// The flag protocol matters: `is_flushing` is cleared with release
    /// ordering, then re-claimed with a compare-exchange only if the queue is
    /// non-empty. A producer that enqueued in the racy window between the
    /// clear and the recheck either observed the cleared flag and sent a
    /// wakeup, or its element is seen by the recheck, which re-arms the
    /// chain. Returns `true` once the processor is closing.
    fn flush(&mut self) -> bool {
        let start = Instant::now();

        while let Some(handler) = self.inner.settings.request_queue.dequeue() {
            ProcessorInner::process(&self.inner, &handler);
        }

        if self.inner.is_closing.load(Ordering::Acquire) {
            return true;
        }

        self.inner.is_flushing.store(false, Ordering::Release);
        if self.inner.settings.request_queue.is_empty()
            || self
                .inner
                .is_flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }

        match processing_delay(start.elapsed()) {
            Some(delay) => {
                self.flush_deadline = Instant::now() + delay;
                self.timer_armed = true;
            }
            None => self.inner.notify.notify_one(),
        }
        false
    }

    fn handle_command(&mut self, command: ProcessorCommand) {
        match command {
            ProcessorCommand::HostUp(address) => self.inner.internal_host_up(address),
            ProcessorCommand::HostDown(address) => self.inner.internal_host_down(address),
            ProcessorCommand::HostAdd(host) => self.inner.internal_host_add(host),
            ProcessorCommand::HostRemove(host) => self.inner.internal_host_remove(&host),
            ProcessorCommand::TokenMapUpdate(token_map) => {
                *self.inner.token_map.write().unwrap() = Some(token_map);
            }
            ProcessorCommand::PoolCriticalError(address, error) => {
                warn!("[{}] Pool hit a critical error: {}", address, error);
                if self.inner.settings.down_host_on_critical_error {
                    self.inner.internal_host_down(address);
                }
            }
        }
    }
}

impl ProcessorInner {
    fn process(inner: &Arc<Self>, handler: &Arc<RequestHandler>) {
        let profile = match handler.profile_name() {
            None => Some(inner.settings.default_profile.clone()),
            Some(name) => {
                let profile = inner.settings.profiles.get(name).cloned();
                if profile.is_some() {
                    trace!("Using execution profile '{}'", name);
                }
                profile
            }
        };
        let Some(profile) = profile else {
            let name = handler.profile_name().unwrap_or_default().to_string();
            handler.set_error(ExecutionError::ExecutionProfileInvalid(name));
            return;
        };

        handler.init(
            profile,
            Arc::clone(&inner.pool_manager),
            inner.token_map.read().unwrap().clone(),
            &inner.settings.timestamp_generator,
            Arc::clone(inner) as Arc<dyn RequestListener>,
            Arc::clone(&inner.settings.pool_settings.metrics),
        );
        handler.execute();
    }

    fn internal_host_add(&self, host: Arc<Host>) {
        {
            let mut hosts = self.hosts.write().unwrap();
            if hosts.contains_key(&host.address) {
                // Duplicate add; the pool manager absorbs it too.
                self.pool_manager_add(host.address);
                return;
            }
            hosts.insert(host.address, Arc::clone(&host));
        }
        self.pool_manager_add(host.address);

        let mut is_ignored = true;
        for policy in &self.policies {
            if policy.distance(&host) != HostDistance::Ignore {
                is_ignored = false;
                policy.on_add(&host);
            }
        }
        if is_ignored {
            debug!("[{}] Host will be ignored by all query plans", host.address);
        }
    }

    fn pool_manager_add(&self, address: SocketAddr) {
        self.pool_manager.add(address);
    }

    fn internal_host_remove(&self, host: &Arc<Host>) {
        self.hosts.write().unwrap().remove(&host.address);
        host.set_removed();
        for policy in &self.policies {
            policy.on_remove(host);
        }
    }

    fn internal_host_up(&self, address: SocketAddr) {
        let host = match self.hosts.read().unwrap().get(&address) {
            Some(host) => Arc::clone(host),
            None => {
                debug!("[{}] Tried to up a host that doesn't exist", address);
                return;
            }
        };
        if host.set_up() {
            for policy in &self.policies {
                if policy.distance(&host) != HostDistance::Ignore {
                    policy.on_up(&host);
                }
            }
        }
    }

    fn internal_host_down(&self, address: SocketAddr) {
        let host = match self.hosts.read().unwrap().get(&address) {
            Some(host) => Arc::clone(host),
            None => {
                debug!("[{}] Tried to down a host that doesn't exist", address);
                return;
            }
        };
        if host.set_down() {
            for policy in &self.policies {
                if policy.distance(&host) != HostDistance::Ignore {
                    policy.on_down(&host);
                }
            }
        }
    }
}

impl RequestListener for ProcessorInner {
    fn on_keyspace_changed(&self, keyspace: &str) {
        let _ = self
            .settings
            .session_events
            .send(SessionEvent::KeyspaceChanged(keyspace.to_string()));
    }

    fn on_result_metadata_changed(&self, prepared_id: &Bytes, result_metadata_id: &Bytes) {
        let _ = self
            .settings
            .session_events
            .send(SessionEvent::PreparedMetadataChanged {
                prepared_id: prepared_id.clone(),
                result_metadata_id: result_metadata_id.clone(),
            });
    }

    fn on_wait_for_schema_agreement(
        &self,
        handler: &Arc<RequestHandler>,
        coordinator: SocketAddr,
        response: &Response,
    ) -> bool {
        schema_agreement::wait_for_schema_agreement(
            &self.pool_manager,
            handler,
            coordinator,
            response,
            self.settings.max_schema_wait_time,
            self.settings.schema_agreement_interval,
        )
    }

    fn on_prepare_all(
        &self,
        handler: &Arc<RequestHandler>,
        coordinator: SocketAddr,
        response: &Response,
    ) -> bool {
        if !self.settings.prepare_on_all_hosts {
            return false;
        }
        prepare_all::prepare_on_all_hosts(&self.pool_manager, handler, coordinator, response)
    }

    fn on_is_host_up(&self, address: SocketAddr) -> bool {
        self.hosts
            .read()
            .unwrap()
            .get(&address)
            .is_some_and(|host| host.is_up())
    }
}

// Turns pool availability transitions into processor commands, so they are
// applied on the worker like every other topology change.
struct PoolEventForwarder {
    command_tx: mpsc::UnboundedSender<ProcessorCommand>,
}

impl ConnectionPoolListener for PoolEventForwarder {
    fn on_pool_up(&self, address: SocketAddr) {
        let _ = self.command_tx.send(ProcessorCommand::HostUp(address));
    }

    fn on_pool_down(&self, address: SocketAddr) {
        let _ = self.command_tx.send(ProcessorCommand::HostDown(address));
    }

    fn on_pool_critical_error(&self, address: SocketAddr, error: ConnectError) {
        let _ = self
            .command_tx
            .send(ProcessorCommand::PoolCriticalError(address, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::Request;
    use crate::statement::Statement;
    use crate::utils::test_utils::{processor_test_rig, setup_tracing, MockTransport};
    use assert_matches::assert_matches;
    use crate::statement::Consistency;

    fn query(contents: &str) -> Request {
        Request::Query {
            statement: Statement::new(contents),
            consistency: Consistency::default(),
            timestamp: None,
        }
    }

    #[test]
    fn processing_delay_respects_the_duty_cycle() {
        // Short flushes re-enter immediately.
        assert_eq!(processing_delay(Duration::from_micros(100)), None);
        // 9 ms of flushing earns 1 ms of idling at a 90% duty cycle.
        assert_eq!(
            processing_delay(Duration::from_millis(9)),
            Some(Duration::from_millis(1))
        );
        assert_eq!(
            processing_delay(Duration::from_millis(90)),
            Some(Duration::from_millis(10))
        );
        // Rounding goes to the nearest millisecond.
        assert_eq!(
            processing_delay(Duration::from_millis(100)),
            Some(Duration::from_millis(11))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drains_queued_requests_in_fifo_order() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = processor_test_rig(&transport, &[1, 2]).await;

        let mut futures = Vec::new();
        for i in 0..5 {
            let (handler, future) =
                RequestHandler::new(query(&format!("SELECT {}", i)), None, false);
            rig.queue.enqueue(handler).unwrap();
            futures.push(future);
        }
        rig.processor.notify_request_async();

        for future in futures {
            assert_matches!(future.await.unwrap(), Ok(_));
        }
        let order = transport.request_log();
        let selects: Vec<_> = order
            .iter()
            .filter(|contents| contents.starts_with("SELECT"))
            .collect();
        assert_eq!(
            selects,
            ["SELECT 0", "SELECT 1", "SELECT 2", "SELECT 3", "SELECT 4"]
                .iter()
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_profile_fails_the_request() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = processor_test_rig(&transport, &[1]).await;

        let (handler, future) =
            RequestHandler::new(query("SELECT 1"), Some("no_such_profile".into()), false);
        rig.queue.enqueue(handler).unwrap();
        rig.processor.notify_request_async();

        assert_matches!(
            future.await.unwrap(),
            Err(ExecutionError::ExecutionProfileInvalid(name)) if name == "no_such_profile"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn notify_is_elided_while_flushing_and_recovers() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = processor_test_rig(&transport, &[1]).await;

        // Pretend a flush chain is running: wakeups are elided.
        rig.processor.set_flushing_for_test(true);
        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.queue.enqueue(handler).unwrap();
        rig.processor.notify_request_async();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!rig.queue.is_empty(), "elided wakeup must not drain");

        // The chain's own recheck (simulated by clearing the flag and
        // notifying) picks the element up.
        rig.processor.set_flushing_for_test(false);
        rig.processor.notify_request_async();
        assert_matches!(future.await.unwrap(), Ok(_));
    }

    #[tokio::test(start_paused = true)]
    async fn topology_add_reaches_pools_and_policies_once() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = processor_test_rig(&transport, &[1]).await;

        let newcomer = Arc::new(Host::new("127.0.0.3:9042".parse().unwrap()));
        rig.processor.notify_host_add_async(Arc::clone(&newcomer));
        rig.processor.notify_host_add_async(Arc::clone(&newcomer));
        tokio::time::sleep(Duration::from_secs(1)).await;

        // One pool, filled once, despite the duplicate notification.
        assert_eq!(
            transport.connect_attempts(newcomer.address),
            rig.num_connections
        );
        assert!(rig
            .processor
            .pool_manager()
            .find_least_busy(newcomer.address)
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_the_queue_with_errors() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = processor_test_rig(&transport, &[1]).await;

        rig.processor.close().await;

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.queue.enqueue(handler).unwrap();
        rig.processor.close_handles().await;

        assert_matches!(
            future.await.unwrap(),
            Err(ExecutionError::NoHostsAvailable)
        );
    }
}
