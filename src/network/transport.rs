//! Transport collaborator interfaces.
//!
//! The dispatch core does not speak the wire protocol. It hands typed
//! [`Request`]s to a [`Connection`] and receives typed [`Response`]s through a
//! completion sink; framing, compression, TLS and authentication all live
//! behind the [`Connector`] that produced the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::errors::{BadKeyspaceName, ConnectError, ConnectionError, RequestError};
use crate::statement::{Consistency, PreparedStatement, Statement};

/// A request the core can put on a connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Request {
    /// An unprepared statement.
    Query {
        statement: Statement,
        consistency: Consistency,
        timestamp: Option<i64>,
    },
    /// Execution of a previously prepared statement.
    Execute {
        prepared: PreparedStatement,
        values: Bytes,
        consistency: Consistency,
        timestamp: Option<i64>,
    },
    /// Statement preparation.
    Prepare { query: String },
    /// Schema version poll of the connected host and its view of the peers,
    /// used while waiting for schema agreement.
    SchemaVersions,
}

/// A response produced by a connection for a single request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Response {
    /// Result rows, opaque to the core. `new_metadata_id` is set when the
    /// server indicated that the prepared statement's result metadata
    /// changed.
    Rows {
        payload: Bytes,
        new_metadata_id: Option<Bytes>,
    },
    /// A result carrying no rows.
    Void,
    /// The outcome of a `Prepare` request.
    Prepared(PreparedStatement),
    /// The session's keyspace was switched by the statement.
    SetKeyspace(String),
    /// The statement changed the schema; the coordinator may not yet agree
    /// with its peers about the new version.
    SchemaChange,
    /// Schema versions reported for the connected host and every peer it
    /// knows about.
    SchemaVersions(Vec<Uuid>),
}

/// Completion callback for a single request written to a connection.
///
/// The sink is invoked exactly once with the outcome. If the connection dies
/// with the request still in flight, the sink is dropped without being
/// invoked; callers that must make progress regardless attach drop guards.
pub type ResponseSink = Box<dyn FnOnce(Result<Response, RequestError>) + Send + 'static>;

/// Resolved when an established connection breaks. The sender side lives in
/// the connector's machinery; dropping it without sending is treated as
/// [`ConnectionError::Closed`].
pub type ErrorReceiver = tokio::sync::oneshot::Receiver<ConnectionError>;

/// A live connection to one node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes a request onto the connection. Returns `false` if the
    /// connection is closed or has run out of stream ids; the sink is then
    /// dropped unused and the caller should pick another connection.
    fn write(&self, request: Request, sink: ResponseSink) -> bool;

    /// Switches the connection to the given keyspace.
    async fn use_keyspace(&self, keyspace: &VerifiedKeyspaceName) -> Result<(), RequestError>;

    /// Closes the connection. The error receiver handed out at connect time
    /// resolves once the close takes effect.
    fn close(&self);
}

/// Performs the full handshake — dial, options exchange, authentication,
/// optional initial `USE keyspace` — and produces a live connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: SocketAddr,
        keyspace: Option<&VerifiedKeyspaceName>,
    ) -> Result<(Arc<dyn Connection>, ErrorReceiver), ConnectError>;
}

/// A keyspace name that was checked against the naming rules, so it can be
/// safely interpolated into a `USE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyspaceName(String);

impl VerifiedKeyspaceName {
    pub fn new(keyspace_name: impl Into<String>) -> Result<Self, BadKeyspaceName> {
        let keyspace_name = keyspace_name.into();

        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }
        if keyspace_name.len() > 48 {
            return Err(BadKeyspaceName::TooLong(keyspace_name));
        }
        if let Some(bad) = keyspace_name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
        {
            return Err(BadKeyspaceName::IllegalCharacter(keyspace_name, bad));
        }

        Ok(VerifiedKeyspaceName(keyspace_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn keyspace_name_validation() {
        assert_matches!(VerifiedKeyspaceName::new("ks_1"), Ok(_));
        assert_matches!(
            VerifiedKeyspaceName::new(""),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49)),
            Err(BadKeyspaceName::TooLong(_))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("ks; DROP TABLE"),
            Err(BadKeyspaceName::IllegalCharacter(_, ';'))
        );
    }
}
