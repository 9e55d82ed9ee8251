//! The control connection collaborator interface.
//!
//! The control connection subscribes to server-side topology and schema
//! events and feeds them to the session. Its protocol is out of scope for the
//! dispatch core; implementations deliver an initial cluster view on connect
//! and a stream of [`ControlEvent`]s afterwards.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cluster::host::{Host, HostMap};
use crate::errors::ConnectError;

/// An event emitted by the control connection after the session is ready.
#[derive(Debug)]
#[non_exhaustive]
pub enum ControlEvent {
    /// A known host became reachable again.
    Up(SocketAddr),
    /// A known host became unreachable.
    Down(SocketAddr),
    /// A new host joined the cluster.
    Add(Arc<Host>),
    /// A host left the cluster.
    Remove(SocketAddr),
    /// The server-side keyspace of the session changed.
    KeyspaceChanged(String),
    /// The control connection hit a non-fatal error worth reporting.
    Error { message: String },
}

/// The initial cluster view plus the event stream, returned by a successful
/// control connection handshake.
#[derive(Debug)]
pub struct ControlHandle {
    /// The host the control connection is established to.
    pub connected_host: Arc<Host>,
    /// All hosts known to the cluster at connect time, including the
    /// connected one.
    pub hosts: HostMap,
    /// Topology and schema events; closing the channel ends the session's
    /// control worker.
    pub events: mpsc::Receiver<ControlEvent>,
}

/// Establishes control connections. Readiness is signalled by `connect`
/// returning; there is no separate ready event.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self, contact_points: &[SocketAddr]) -> Result<ControlHandle, ConnectError>;
}
