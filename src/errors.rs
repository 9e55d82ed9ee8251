//! Error types exposed by the dispatch core.
//!
//! Errors are split by the layer at which they surface:
//! - [`ConnectError`] — produced by a [`Connector`](crate::network::Connector)
//!   while opening a single connection. Some kinds are *critical*: they cannot
//!   be fixed by reconnecting and abort the whole pool.
//! - [`ConnectionError`] — a previously working connection broke mid-stream.
//! - [`RequestError`] — a single request attempt on a single connection failed.
//! - [`ExecutionError`] — the final error set on a request's future, after the
//!   retry and speculative execution policies gave up.
//! - [`NewSessionError`] / [`CloseError`] — session lifecycle errors.

use std::sync::Arc;

use thiserror::Error;

/// An error encountered while opening a connection to a node.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The node rejected the provided credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The configured keyspace does not exist on the node.
    #[error("Keyspace {0:?} does not exist")]
    Keyspace(String),

    /// The handshake did not complete in time.
    #[error("Connect timeout")]
    Timeout,

    /// Input/output error while dialing or during the handshake.
    #[error("Network error: {0}")]
    Network(Arc<std::io::Error>),

    /// The connector misbehaved in a way that is not attributable to the node.
    #[error("Internal connector error: {0}")]
    Internal(String),
}

impl ConnectError {
    /// Critical errors abort the whole pool instead of scheduling a reconnect.
    pub fn is_critical(&self) -> bool {
        matches!(self, ConnectError::Auth(_) | ConnectError::Keyspace(_))
    }

    pub fn is_keyspace_error(&self) -> bool {
        matches!(self, ConnectError::Keyspace(_))
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> ConnectError {
        ConnectError::Network(Arc::new(err))
    }
}

/// An error that broke an established connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer violated the protocol; the connection cannot be trusted anymore.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was closed, locally or by the peer.
    #[error("Connection closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> ConnectionError {
        ConnectionError::Io(Arc::new(err))
    }
}

/// An error returned by the database for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// Not enough replicas were alive to satisfy the requested consistency.
    #[error("Not enough replicas available for the requested consistency")]
    Unavailable,

    /// The coordinator timed out waiting for replica reads.
    #[error("Read timeout")]
    ReadTimeout {
        received: i32,
        required: i32,
        data_present: bool,
    },

    /// The coordinator timed out waiting for replica writes.
    #[error("Write timeout")]
    WriteTimeout { received: i32, required: i32 },

    /// The coordinator is overloaded and shed the request.
    #[error("Node overloaded")]
    Overloaded,

    /// The coordinator is still bootstrapping and cannot serve requests.
    #[error("Node is bootstrapping")]
    IsBootstrapping,

    /// The request was syntactically or semantically invalid.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Unspecified server-side failure.
    #[error("Server error: {0}")]
    ServerError(String),
}

/// An error of a single request attempt, on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The database responded with an error.
    #[error("Database returned an error: {0}")]
    Db(#[from] DbError),

    /// The connection broke before the response arrived.
    #[error(transparent)]
    Broken(#[from] ConnectionError),

    /// The response kind did not match the request.
    #[error("Unexpected response kind")]
    UnexpectedResponse,
}

/// The final error surfaced on a request's future.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The query plan was exhausted without a single connection accepting
    /// the request, or the session is not connected.
    #[error("No hosts available for the request")]
    NoHostsAvailable,

    /// The request queue is full; the caller should back off.
    #[error("The request queue has reached capacity")]
    RequestQueueFull,

    /// The request named an execution profile that does not exist.
    #[error("Execution profile {0:?} does not exist")]
    ExecutionProfileInvalid(String),

    /// The last attempt's error, after the retry policy decided to give up.
    #[error(transparent)]
    LastAttemptError(RequestError),

    /// The response kind did not match what the caller asked for.
    #[error("Received an unexpected response kind")]
    UnexpectedResponse,

    /// No attempt produced a response within the profile's request timeout.
    #[error("Request timeout: no response within {0:?}")]
    RequestTimeout(std::time::Duration),
}

/// An error that occurred during session creation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// `connect` was called on a session that is not in the closed state.
    #[error("Session is already connecting, connected or closing")]
    UnableToConnect,

    /// None of the configured contact points could be resolved.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The list of contact points is empty.
    #[error("Empty contact point list")]
    EmptyContactPoints,

    /// No host accepted connections during session initialization.
    #[error("Unable to connect to any hosts")]
    NoHostsAvailable,

    /// The keyspace requested at connect time does not exist.
    #[error("Unable to set keyspace: keyspace {0:?} does not exist")]
    UnableToSetKeyspace(String),

    /// The control connection could not be established.
    #[error("Control connection failed: {0}")]
    ControlConnection(#[from] ConnectError),

    /// The keyspace name passed at connect time is not a valid identifier.
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// An error that occurred while closing a session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CloseError {
    /// `close` was called on a session that is already closing or closed.
    #[error("Session is already closing or closed")]
    UnableToClose,
}

/// An invalid keyspace name was passed to the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,

    #[error("Keyspace name {0} is longer than the allowed 48 characters")]
    TooLong(String),

    #[error("Keyspace name {0} contains illegal character {1:?}")]
    IllegalCharacter(String, char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_classification() {
        assert!(ConnectError::Auth("bad password".into()).is_critical());
        assert!(ConnectError::Keyspace("nope".into()).is_critical());
        assert!(!ConnectError::Timeout.is_critical());
        assert!(!ConnectError::Internal("bug".into()).is_critical());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!ConnectError::from(io).is_critical());
    }

    #[test]
    fn keyspace_classification() {
        assert!(ConnectError::Keyspace("nope".into()).is_keyspace_error());
        assert!(!ConnectError::Auth("denied".into()).is_keyspace_error());
    }
}
