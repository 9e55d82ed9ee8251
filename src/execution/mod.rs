//! Request execution: the shared request queue, per-request handlers, the
//! processor event loops draining the queue, and the auxiliary flows they
//! orchestrate (prepare fan-out, schema agreement).

use std::net::SocketAddr;

use bytes::Bytes;

use crate::network::transport::Response;

pub(crate) mod prepare_all;
pub(crate) mod processor;
pub(crate) mod processor_manager;
pub(crate) mod request_handler;
pub(crate) mod request_queue;
pub(crate) mod schema_agreement;

/// A completed request: the response plus the host that served it.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub response: Response,
    /// The host whose connection produced the response.
    pub coordinator: SocketAddr,
}

/// Callbacks a request handler makes into the processor that is driving it.
pub(crate) trait RequestListener: Send + Sync {
    /// A response reported that the session's keyspace changed.
    fn on_keyspace_changed(&self, keyspace: &str);

    /// The server sent new result metadata for a prepared statement.
    fn on_result_metadata_changed(&self, prepared_id: &Bytes, result_metadata_id: &Bytes);

    /// A schema-changing response wants to wait for schema agreement before
    /// resolving. Returns `true` when the wait was started; the future is
    /// then resolved by the agreement poll.
    fn on_wait_for_schema_agreement(
        &self,
        handler: &std::sync::Arc<request_handler::RequestHandler>,
        coordinator: SocketAddr,
        response: &Response,
    ) -> bool;

    /// A successful prepare wants to propagate to the remaining hosts.
    /// Returns `true` when the fan-out was started; the future is then
    /// resolved by the fan-out countdown.
    fn on_prepare_all(
        &self,
        handler: &std::sync::Arc<request_handler::RequestHandler>,
        coordinator: SocketAddr,
        response: &Response,
    ) -> bool;

    /// Whether the processor currently believes the host is up.
    fn on_is_host_up(&self, address: SocketAddr) -> bool;
}
