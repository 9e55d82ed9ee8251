//! Prepare-on-all-hosts fan-out.
//!
//! After a statement is successfully prepared on one host, the processor
//! pushes the same `PREPARE` to every other host that currently has a live
//! connection, so later executions don't hit "unprepared" errors when the
//! load balancer picks a different coordinator. Fan-out failures are not
//! surfaced; the caller's future resolves with the original response once the
//! countdown completes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::execution::request_handler::RequestHandler;
use crate::execution::QueryResponse;
use crate::network::pool_manager::ConnectionPoolManager;
use crate::network::transport::{Request, Response, ResponseSink};

/// Countdown over the fan-out targets; resolves the original request's future
/// when it reaches zero.
pub(crate) struct PrepareAllHandler {
    request_handler: Arc<RequestHandler>,
    coordinator: SocketAddr,
    response: Response,
    remaining: AtomicUsize,
}

impl PrepareAllHandler {
    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.request_handler.resolve(QueryResponse {
                response: self.response.clone(),
                coordinator: self.coordinator,
            });
        }
    }
}

// One per fan-out target. The countdown ticks on drop, so a target whose
// write failed, whose connection died mid-prepare, or that had no connection
// at all still completes the countdown.
pub(crate) struct PrepareAllCallback {
    address: SocketAddr,
    handler: Arc<PrepareAllHandler>,
}

impl PrepareAllCallback {
    fn into_sink(self) -> ResponseSink {
        Box::new(move |result| {
            if let Err(error) = result {
                trace!("[{}] Prepare fan-out failed: {}", self.address, error);
            }
            // The whole callback must live until the sink fires; its drop
            // ticks the countdown.
            drop(self);
        })
    }
}

impl Drop for PrepareAllCallback {
    fn drop(&mut self) {
        self.handler.finish_one();
    }
}

/// Launches the fan-out. Returns `false` (caller resolves the future itself)
/// when there is nothing to fan out to.
pub(crate) fn prepare_on_all_hosts(
    pool_manager: &Arc<ConnectionPoolManager>,
    request_handler: &Arc<RequestHandler>,
    coordinator: SocketAddr,
    response: &Response,
) -> bool {
    let Request::Prepare { query } = request_handler.request() else {
        return false;
    };

    let addresses = pool_manager.available();
    if addresses.is_empty() || (addresses.len() == 1 && addresses[0] == coordinator) {
        return false;
    }

    let handler = Arc::new(PrepareAllHandler {
        request_handler: Arc::clone(request_handler),
        coordinator,
        response: response.clone(),
        // The coordinator already holds the prepared statement.
        remaining: AtomicUsize::new(addresses.len() - 1),
    });

    for address in addresses {
        if address == coordinator {
            continue;
        }
        let callback = PrepareAllCallback {
            address,
            handler: Arc::clone(&handler),
        };
        if let Some(connection) = pool_manager.find_least_busy(address) {
            let request = Request::Prepare {
                query: query.clone(),
            };
            connection.write(request, callback.into_sink());
        }
        // No connection: the callback drops right here and the countdown
        // still ticks.
    }

    true
}
