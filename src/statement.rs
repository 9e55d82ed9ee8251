//! Statements and the per-request options attached to them.

use bytes::Bytes;

/// Consistency level of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    #[default]
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

/// An unprepared CQL statement together with its serialized values.
///
/// The dispatch core treats the contents and values as opaque; serialization
/// and result decoding belong to the transport collaborator.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The statement text.
    pub contents: String,
    /// Already-serialized bound values, opaque to the core.
    pub values: Bytes,
    /// Idempotent statements may be retried on broken connections and are
    /// eligible for speculative execution.
    pub is_idempotent: bool,
    /// Name of the execution profile to run this statement with.
    /// `None` selects the session's default profile.
    pub execution_profile_name: Option<String>,
    /// Overrides the profile's consistency for this statement only.
    pub consistency: Option<Consistency>,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Statement {
            contents: contents.into(),
            values: Bytes::new(),
            is_idempotent: false,
            execution_profile_name: None,
            consistency: None,
        }
    }

    pub fn with_values(mut self, values: Bytes) -> Self {
        self.values = values;
        self
    }

    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.is_idempotent = is_idempotent;
        self
    }

    pub fn execution_profile(mut self, name: impl Into<String>) -> Self {
        self.execution_profile_name = Some(name.into());
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Statement {
        Statement::new(contents)
    }
}

/// A statement prepared on the cluster, identified by the id the server
/// assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-assigned statement id.
    pub id: Bytes,
    /// The statement this id was prepared from.
    pub statement: String,
}

impl PreparedStatement {
    pub fn new(id: Bytes, statement: impl Into<String>) -> Self {
        PreparedStatement {
            id,
            statement: statement.into(),
        }
    }
}
