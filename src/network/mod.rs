//! The network layer: transport collaborator interfaces, per-host connection
//! pools and the pool manager.

pub mod transport;

pub(crate) mod connection;
pub(crate) mod connection_pool;
pub(crate) mod pool_connector;
pub(crate) mod pool_manager;

pub use transport::{
    Connection, Connector, ErrorReceiver, Request, Response, ResponseSink, VerifiedKeyspaceName,
};
