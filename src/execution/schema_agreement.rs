//! Waiting for schema agreement after DDL.
//!
//! A schema-changing statement resolves its future only once every reachable
//! peer reports the same schema version, or the configured wait time runs
//! out. Either way the original response is then delivered; disagreement is
//! not an error, just a warning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{ConnectionError, RequestError};
use crate::execution::request_handler::RequestHandler;
use crate::execution::QueryResponse;
use crate::network::pool_manager::ConnectionPoolManager;
use crate::network::transport::{Request, Response, ResponseSink};

/// Polls the coordinator for schema versions until they agree, then resolves
/// the request's future with the original response. Returns `false` if no
/// poll could even be started; the caller then resolves immediately.
pub(crate) fn wait_for_schema_agreement(
    pool_manager: &Arc<ConnectionPoolManager>,
    request_handler: &Arc<RequestHandler>,
    coordinator: SocketAddr,
    response: &Response,
    max_wait_time: Duration,
    interval: Duration,
) -> bool {
    if pool_manager.find_least_busy(coordinator).is_none() {
        return false;
    }

    let pool_manager = Arc::clone(pool_manager);
    let request_handler = Arc::clone(request_handler);
    let response = response.clone();

    tokio::spawn(async move {
        let deadline = Instant::now() + max_wait_time;
        loop {
            match fetch_schema_versions(&pool_manager, coordinator).await {
                Ok(versions) if versions_agree(&versions) => {
                    debug!("[{}] Schema agreement reached", coordinator);
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    debug!("[{}] Schema version poll failed: {}", coordinator, error);
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    "[{}] No schema agreement within {} ms; proceeding anyway",
                    coordinator,
                    max_wait_time.as_millis()
                );
                break;
            }
            tokio::time::sleep(interval).await;
        }
        request_handler.resolve(QueryResponse {
            response,
            coordinator,
        });
    });

    true
}

fn versions_agree(versions: &[uuid::Uuid]) -> bool {
    match versions.split_first() {
        Some((first, rest)) => rest.iter().all(|version| version == first),
        None => false,
    }
}

async fn fetch_schema_versions(
    pool_manager: &Arc<ConnectionPoolManager>,
    coordinator: SocketAddr,
) -> Result<Vec<uuid::Uuid>, RequestError> {
    let connection = pool_manager
        .find_least_busy(coordinator)
        .ok_or(RequestError::Broken(ConnectionError::Closed))?;

    let (sender, receiver) = oneshot::channel();
    let sink: ResponseSink = Box::new(move |result| {
        let _ = sender.send(result);
    });
    if !connection.write(Request::SchemaVersions, sink) {
        return Err(RequestError::Broken(ConnectionError::Closed));
    }

    match receiver.await {
        Ok(Ok(Response::SchemaVersions(versions))) => Ok(versions),
        Ok(Ok(_)) => Err(RequestError::UnexpectedResponse),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(RequestError::Broken(ConnectionError::Closed)),
    }
}
