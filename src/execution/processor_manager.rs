//! Fan-out of session-level events to the request processors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use crate::cluster::host::{Host, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::NewSessionError;
use crate::execution::processor::{ProcessorSettings, RequestProcessor};
use crate::network::transport::VerifiedKeyspaceName;

/// Owns the session's request processors.
///
/// Request wakeups are round-robined: because a processor ignores wakeups
/// while it is already flushing, the rotation biases toward waking a
/// processor that was idle. Topology changes, keyspace updates and shutdown
/// are broadcast to every processor.
pub(crate) struct RequestProcessorManager {
    processors: Vec<RequestProcessor>,
    current: AtomicUsize,
}

impl RequestProcessorManager {
    /// Connects `count` processors concurrently. Any processor failing to
    /// initialize fails the whole session; keyspace errors win over
    /// no-hosts errors, matching what the caller reports.
    pub(crate) async fn connect(
        count: usize,
        settings: ProcessorSettings,
        current_host: &Arc<Host>,
        hosts: &HostMap,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Result<RequestProcessorManager, NewSessionError> {
        let connects = (0..count).map(|_| {
            RequestProcessor::connect(settings.clone(), current_host, hosts, keyspace.clone())
        });

        let mut processors = Vec::with_capacity(count);
        let mut first_error: Option<NewSessionError> = None;
        for result in join_all(connects).await {
            match result {
                Ok(processor) => processors.push(processor),
                Err(error) => {
                    let takes_precedence = matches!(
                        error,
                        NewSessionError::UnableToSetKeyspace(_)
                    ) || first_error.is_none();
                    if takes_precedence {
                        first_error = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            // Shut down whatever connected before reporting failure.
            let manager = RequestProcessorManager {
                processors,
                current: AtomicUsize::new(0),
            };
            manager.close().await;
            manager.close_handles().await;
            return Err(error);
        }

        debug!("Connected {} request processor(s)", processors.len());
        Ok(RequestProcessorManager {
            processors,
            current: AtomicUsize::new(0),
        })
    }

    /// Wakes one processor for newly queued requests.
    pub(crate) fn notify_request_async(&self) {
        let index = self.current.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        self.processors[index].notify_request_async();
    }

    pub(crate) fn notify_host_add_async(&self, host: &Arc<Host>) {
        for processor in &self.processors {
            processor.notify_host_add_async(Arc::clone(host));
        }
    }

    pub(crate) fn notify_host_remove_async(&self, host: &Arc<Host>) {
        for processor in &self.processors {
            processor.notify_host_remove_async(Arc::clone(host));
        }
    }

    pub(crate) fn notify_host_up_async(&self, address: SocketAddr) {
        for processor in &self.processors {
            processor.notify_host_up_async(address);
        }
    }

    pub(crate) fn notify_host_down_async(&self, address: SocketAddr) {
        for processor in &self.processors {
            processor.notify_host_down_async(address);
        }
    }

    pub(crate) fn notify_token_map_update_async(&self, token_map: &Arc<dyn TokenMap>) {
        for processor in &self.processors {
            processor.notify_token_map_update_async(Arc::clone(token_map));
        }
    }

    /// Applies a keyspace change synchronously to every processor.
    pub(crate) fn keyspace_update(&self, keyspace: &VerifiedKeyspaceName) {
        for processor in &self.processors {
            processor.keyspace_update(keyspace.clone());
        }
    }

    /// Closes every processor's pools and waits for them to drain.
    pub(crate) async fn close(&self) {
        join_all(self.processors.iter().map(RequestProcessor::close)).await;
    }

    /// Stops every processor's worker. Callers must `close` first.
    pub(crate) async fn close_handles(&self) {
        join_all(
            self.processors
                .iter()
                .map(RequestProcessor::close_handles),
        )
        .await;
    }

    #[cfg(test)]
    pub(crate) fn processors(&self) -> &[RequestProcessor] {
        &self.processors
    }
}

impl std::fmt::Debug for RequestProcessorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProcessorManager")
            .field("processors", &self.processors.len())
            .finish_non_exhaustive()
    }
}
