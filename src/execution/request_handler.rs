//! One pending request, from enqueue to the completion of its future.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::token_map::TokenMap;
use crate::errors::{ConnectionError, ExecutionError, RequestError};
use crate::execution::QueryResponse;
use crate::execution::RequestListener;
use crate::network::connection::PooledConnection;
use crate::network::pool_manager::ConnectionPoolManager;
use crate::network::transport::{Request, Response, ResponseSink};
use crate::observability::metrics::Metrics;
use crate::policies::load_balancing::QueryPlan;
use crate::policies::retry::{RequestInfo, RetryDecision, RetrySession};
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::statement::Consistency;

/// The resolved completion side of a request, received by the caller.
pub(crate) type RequestFuture = oneshot::Receiver<Result<QueryResponse, ExecutionError>>;

// Everything a handler needs once a processor picked it up.
struct RequestContext {
    profile: ExecutionProfile,
    pool_manager: Arc<ConnectionPoolManager>,
    token_map: Option<Arc<dyn TokenMap>>,
    listener: Arc<dyn RequestListener>,
    metrics: Arc<Metrics>,
    timestamp: Option<i64>,
}

struct ExecState {
    plan: Option<QueryPlan>,
    retry_session: Option<Box<dyn RetrySession>>,
    current_consistency: Consistency,
    // Attempts written but not yet completed; the request only fails once the
    // plan is exhausted and this drops to zero.
    outstanding: usize,
    finished: bool,
    last_error: Option<RequestError>,
    attempted: Vec<SocketAddr>,
}

/// A request travelling through the dispatch core.
///
/// The handler is shared between the request queue, the processor that drains
/// it and every outstanding per-host attempt; whichever attempt completes
/// decisively first resolves the caller's future, later completions are
/// absorbed.
pub(crate) struct RequestHandler {
    request: Request,
    profile_name: Option<String>,
    is_idempotent: bool,
    consistency_override: Option<Consistency>,
    future: Mutex<Option<oneshot::Sender<Result<QueryResponse, ExecutionError>>>>,
    context: OnceLock<RequestContext>,
    exec: Mutex<ExecState>,
    // Source of the owned references held by attempt guards, speculative
    // execution timers and the deferred-resolution flows.
    weak_self: Weak<RequestHandler>,
}

impl RequestHandler {
    pub(crate) fn new(
        request: Request,
        profile_name: Option<String>,
        is_idempotent: bool,
    ) -> (Arc<Self>, RequestFuture) {
        let (sender, receiver) = oneshot::channel();
        let consistency_override = match &request {
            Request::Query { statement, .. } => statement.consistency,
            _ => None,
        };
        let handler = Arc::new_cyclic(|weak_self| RequestHandler {
            request,
            profile_name,
            is_idempotent,
            consistency_override,
            future: Mutex::new(Some(sender)),
            context: OnceLock::new(),
            exec: Mutex::new(ExecState {
                plan: None,
                retry_session: None,
                current_consistency: Consistency::default(),
                outstanding: 0,
                finished: false,
                last_error: None,
                attempted: Vec::new(),
            }),
            weak_self: Weak::clone(weak_self),
        });
        (handler, receiver)
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn profile_name(&self) -> Option<&str> {
        self.profile_name.as_deref()
    }

    /// Binds the handler to the processor that dequeued it. Called exactly
    /// once, on the processor, before `execute`.
    pub(crate) fn init(
        &self,
        profile: ExecutionProfile,
        pool_manager: Arc<ConnectionPoolManager>,
        token_map: Option<Arc<dyn TokenMap>>,
        timestamp_generator: &Arc<dyn TimestampGenerator>,
        listener: Arc<dyn RequestListener>,
        metrics: Arc<Metrics>,
    ) {
        let timestamp = match &self.request {
            Request::Query { .. } | Request::Execute { .. } => {
                Some(timestamp_generator.next_timestamp())
            }
            _ => None,
        };
        let context = RequestContext {
            profile,
            pool_manager,
            token_map,
            listener,
            metrics,
            timestamp,
        };
        if self.context.set(context).is_err() {
            trace!("Request handler initialized twice; keeping the first context");
        }
    }

    /// Builds the query plan and launches the first attempt. Also arms the
    /// speculative execution timer when the profile calls for one.
    pub(crate) fn execute(&self) {
        let ctx = self.context().expect("execute before init");

        let keyspace = ctx.pool_manager.keyspace();
        let plan = ctx.profile.load_balancing_policy().new_query_plan(
            keyspace.as_ref().map(|name| name.as_str()),
            &self.request,
            ctx.token_map.as_ref(),
        );
        {
            let mut exec = self.exec.lock().unwrap();
            exec.plan = Some(plan);
            exec.retry_session = Some(ctx.profile.retry_policy().new_session());
            exec.current_consistency = self
                .consistency_override
                .unwrap_or_else(|| ctx.profile.consistency());
        }

        if let Some(timeout) = ctx.profile.request_timeout() {
            let handler = self.strong();
            let metrics = Arc::clone(&ctx.metrics);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !handler.is_finished() {
                    metrics.inc_request_timeouts();
                    handler.set_error(ExecutionError::RequestTimeout(timeout));
                }
            });
        }

        if self.is_idempotent {
            if let Some(policy) = ctx.profile.speculative_execution_policy() {
                let handler = self.strong();
                let max_attempts = policy.max_attempt_count();
                let interval = policy.retry_interval();
                tokio::spawn(async move {
                    for _ in 0..max_attempts {
                        tokio::time::sleep(interval).await;
                        if handler.is_finished() {
                            return;
                        }
                        trace!("Launching speculative attempt");
                        handler.next_attempt();
                    }
                });
            }
        }

        self.next_attempt();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.exec.lock().unwrap().finished
    }

    /// Resolves the caller's future with a successful response. Later calls
    /// and completions are no-ops.
    pub(crate) fn resolve(&self, response: QueryResponse) {
        if self.finish() {
            if let Some(sender) = self.future.lock().unwrap().take() {
                let _ = sender.send(Ok(response));
            }
        }
    }

    /// Fails the caller's future.
    pub(crate) fn set_error(&self, error: ExecutionError) {
        if self.finish() {
            if let Some(sender) = self.future.lock().unwrap().take() {
                let _ = sender.send(Err(error));
            }
        }
    }

    // Returns true for the one caller that performed the transition.
    fn finish(&self) -> bool {
        let mut exec = self.exec.lock().unwrap();
        if exec.finished {
            return false;
        }
        exec.finished = true;
        true
    }

    fn context(&self) -> Option<&RequestContext> {
        self.context.get()
    }

    // A strong reference to hand out; always succeeds while `&self` exists.
    fn strong(&self) -> Arc<RequestHandler> {
        self.weak_self
            .upgrade()
            .expect("handler alive while borrowed")
    }

    /// Walks the query plan until some connection accepts a write or the plan
    /// runs dry.
    fn next_attempt(&self) {
        let Some(ctx) = self.context() else { return };
        loop {
            let host = {
                let mut exec = self.exec.lock().unwrap();
                if exec.finished {
                    return;
                }
                match exec.plan.as_mut().and_then(|plan| plan.next()) {
                    Some(host) => host,
                    None => {
                        if exec.outstanding > 0 {
                            // An attempt is still in flight; it will either
                            // resolve the future or come back here.
                            return;
                        }
                        let last_error = exec.last_error.take();
                        drop(exec);
                        self.set_error(match last_error {
                            Some(error) => ExecutionError::LastAttemptError(error),
                            None => ExecutionError::NoHostsAvailable,
                        });
                        return;
                    }
                }
            };

            if !ctx.listener.on_is_host_up(host.address) {
                trace!("[{}] Skipping host that is not up", host.address);
                continue;
            }
            let Some(connection) = ctx.pool_manager.find_least_busy(host.address) else {
                trace!("[{}] No connection available", host.address);
                continue;
            };

            self.write_attempt(host.address, &connection);
            return;
        }
    }

    // Continuation is driven by the attempt guard: a response or error goes
    // through `on_attempt_complete`, a refused or abandoned write through
    // `on_attempt_aborted`.
    fn write_attempt(&self, address: SocketAddr, connection: &Arc<PooledConnection>) {
        let request = self.attempt_request();
        {
            let mut exec = self.exec.lock().unwrap();
            exec.outstanding += 1;
            exec.attempted.push(address);
        }

        let guard = AttemptGuard {
            handler: self.strong(),
            address,
            started: Instant::now(),
            fired: false,
        };
        let sink: ResponseSink = Box::new(move |result| guard.complete(result));

        if connection.write(request, sink) {
            if let Some(ctx) = self.context() {
                ctx.metrics.inc_total_requests();
            }
        }
    }

    // The request template with the current attempt's consistency and the
    // handler's timestamp filled in.
    fn attempt_request(&self) -> Request {
        let consistency = self.exec.lock().unwrap().current_consistency;
        let timestamp = self.context().and_then(|ctx| ctx.timestamp);
        let mut request = self.request.clone();
        match &mut request {
            Request::Query {
                consistency: slot,
                timestamp: ts,
                ..
            }
            | Request::Execute {
                consistency: slot,
                timestamp: ts,
                ..
            } => {
                *slot = consistency;
                *ts = timestamp;
            }
            _ => {}
        }
        request
    }

    fn on_attempt_complete(
        &self,
        address: SocketAddr,
        elapsed: Duration,
        result: Result<Response, RequestError>,
    ) {
        let Some(ctx) = self.context() else { return };
        {
            let mut exec = self.exec.lock().unwrap();
            exec.outstanding -= 1;
            if exec.finished {
                return;
            }
        }

        match result {
            Ok(response) => {
                let _ = ctx
                    .metrics
                    .log_request_latency(elapsed.as_millis() as u64);
                self.handle_response(address, response);
            }
            Err(error) => {
                trace!("[{}] Request attempt failed: {}", address, error);
                ctx.metrics.inc_failed_requests();
                let decision = {
                    let mut exec = self.exec.lock().unwrap();
                    let info = RequestInfo {
                        error: &error,
                        is_idempotent: self.is_idempotent,
                        consistency: exec.current_consistency,
                    };
                    match exec.retry_session.as_mut() {
                        Some(session) => session.decide_should_retry(info),
                        None => RetryDecision::DontRetry,
                    }
                };
                match decision {
                    RetryDecision::RetrySameHost(consistency) => {
                        ctx.metrics.inc_retries_num();
                        self.note_retry(error, consistency);
                        self.retry_on_host(address);
                    }
                    RetryDecision::RetryNextHost(consistency) => {
                        ctx.metrics.inc_retries_num();
                        self.note_retry(error, consistency);
                        self.next_attempt();
                    }
                    RetryDecision::DontRetry => {
                        self.set_error(ExecutionError::LastAttemptError(error));
                    }
                }
            }
        }
    }

    // A write was refused or abandoned without a response; move on to the
    // next host of the plan.
    fn on_attempt_aborted(&self, address: SocketAddr) {
        trace!("[{}] Request attempt aborted without a response", address);
        {
            let mut exec = self.exec.lock().unwrap();
            exec.outstanding -= 1;
            if exec.finished {
                return;
            }
            exec.last_error
                .get_or_insert(RequestError::Broken(ConnectionError::Closed));
        }
        self.next_attempt();
    }

    fn note_retry(&self, error: RequestError, consistency: Option<Consistency>) {
        let mut exec = self.exec.lock().unwrap();
        exec.last_error = Some(error);
        if let Some(consistency) = consistency {
            exec.current_consistency = consistency;
        }
    }

    fn retry_on_host(&self, address: SocketAddr) {
        let Some(ctx) = self.context() else { return };
        match ctx.pool_manager.find_least_busy(address) {
            Some(connection) => self.write_attempt(address, &connection),
            None => self.next_attempt(),
        }
    }

    // Successful response; a few kinds detour through the processor before
    // (or instead of) resolving the future directly.
    fn handle_response(&self, address: SocketAddr, response: Response) {
        let Some(ctx) = self.context() else { return };
        match &response {
            Response::SetKeyspace(keyspace) => {
                ctx.listener.on_keyspace_changed(keyspace);
            }
            Response::Rows {
                new_metadata_id: Some(new_metadata_id),
                ..
            } => {
                if let Request::Execute { prepared, .. } = &self.request {
                    ctx.listener
                        .on_result_metadata_changed(&prepared.id, new_metadata_id);
                }
            }
            Response::SchemaChange => {
                // Resolution is deferred until schema agreement is reached
                // (or given up on).
                if ctx
                    .listener
                    .on_wait_for_schema_agreement(&self.strong(), address, &response)
                {
                    return;
                }
            }
            Response::Prepared(_) => {
                // Resolution is deferred until the prepare fan-out countdown
                // completes.
                if ctx
                    .listener
                    .on_prepare_all(&self.strong(), address, &response)
                {
                    return;
                }
            }
            _ => {}
        }
        self.resolve(QueryResponse {
            response,
            coordinator: address,
        });
    }

    #[cfg(test)]
    pub(crate) fn attempted_hosts(&self) -> Vec<SocketAddr> {
        self.exec.lock().unwrap().attempted.clone()
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("request", &self.request)
            .field("profile_name", &self.profile_name)
            .field("is_idempotent", &self.is_idempotent)
            .finish_non_exhaustive()
    }
}

// Ties an attempt's lifecycle to its sink: invoked exactly once on a
// response, or dropped by a transport that will never respond.
struct AttemptGuard {
    handler: Arc<RequestHandler>,
    address: SocketAddr,
    started: Instant,
    fired: bool,
}

impl AttemptGuard {
    fn complete(mut self, result: Result<Response, RequestError>) {
        self.fired = true;
        let handler = Arc::clone(&self.handler);
        handler.on_attempt_complete(self.address, self.started.elapsed(), result);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.fired {
            self.handler.on_attempt_aborted(self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::execution_profile::ExecutionProfile;
    use crate::errors::DbError;
    use crate::policies::speculative_execution::SimpleSpeculativeExecutionPolicy;
    use crate::statement::Statement;
    use crate::utils::test_utils::{
        handler_test_rig, setup_tracing, ManualResponses, MockTransport,
    };
    use assert_matches::assert_matches;

    fn query(contents: &str) -> Request {
        Request::Query {
            statement: Statement::new(contents),
            consistency: Consistency::default(),
            timestamp: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_first_healthy_host() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = handler_test_rig(&transport, &[1, 2], ExecutionProfile::builder().build()).await;

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        let response = future.await.unwrap().unwrap();
        assert_eq!(response.coordinator, rig.address(1));
        assert_eq!(handler.attempted_hosts(), vec![rig.address(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_fails_with_no_hosts_available() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = handler_test_rig(&transport, &[], ExecutionProfile::builder().build()).await;

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        assert_matches!(
            future.await.unwrap(),
            Err(ExecutionError::NoHostsAvailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_write_advances_to_the_next_host() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = handler_test_rig(&transport, &[1, 2], ExecutionProfile::builder().build()).await;
        // Host 1 accepts connections but its transport refuses writes.
        transport.refuse_writes(rig.address(1));

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        let response = future.await.unwrap().unwrap();
        assert_eq!(response.coordinator, rig.address(2));
        assert_eq!(
            handler.attempted_hosts(),
            vec![rig.address(1), rig.address(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_db_error_moves_to_next_host() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = handler_test_rig(&transport, &[1, 2], ExecutionProfile::builder().build()).await;
        transport.respond_with_error(rig.address(1), DbError::Unavailable);

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        let response = future.await.unwrap().unwrap();
        assert_eq!(response.coordinator, rig.address(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_db_error_surfaces_as_last_attempt_error() {
        setup_tracing();
        let transport = MockTransport::new();
        let rig = handler_test_rig(&transport, &[1, 2], ExecutionProfile::builder().build()).await;
        transport.respond_with_error(rig.address(1), DbError::Invalid("syntax".into()));

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        assert_matches!(
            future.await.unwrap(),
            Err(ExecutionError::LastAttemptError(RequestError::Db(
                DbError::Invalid(_)
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_no_host_responds() {
        setup_tracing();
        let transport = MockTransport::new();
        let profile = ExecutionProfile::builder()
            .request_timeout(Some(Duration::from_secs(2)))
            .build();
        let rig = handler_test_rig(&transport, &[1], profile).await;
        let _manual = ManualResponses::install(&transport);

        let (handler, future) = RequestHandler::new(query("SELECT 1"), None, false);
        rig.run(&handler);

        assert_matches!(
            future.await.unwrap(),
            Err(ExecutionError::RequestTimeout(timeout)) if timeout == Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn speculative_attempt_rescues_a_stuck_host() {
        setup_tracing();
        let transport = MockTransport::new();
        let profile = ExecutionProfile::builder()
            .speculative_execution_policy(Some(Arc::new(SimpleSpeculativeExecutionPolicy {
                max_attempt_count: 2,
                retry_interval: Duration::from_millis(50),
            })))
            .build();
        let rig = handler_test_rig(&transport, &[1, 2], profile).await;
        // Host 1 accepts the write but never responds.
        let manual = ManualResponses::install_for(&transport, rig.address(1));

        let (handler, future) =
            RequestHandler::new(query("SELECT 1"), None, /* is_idempotent */ true);
        rig.run(&handler);

        let response = future.await.unwrap().unwrap();
        assert_eq!(response.coordinator, rig.address(2));
        assert_eq!(
            handler.attempted_hosts(),
            vec![rig.address(1), rig.address(2)]
        );
        drop(manual);
    }
}
