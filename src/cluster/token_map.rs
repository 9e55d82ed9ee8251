//! The token map collaborator interface.
//!
//! Token-aware load balancing policies consult a token map to find replicas
//! for a partition key. The map itself — ring construction, replication
//! strategies — is opaque to the dispatch core; the core only keeps the map
//! current as the topology changes and hands it to the policies.

use std::sync::Arc;

use crate::cluster::host::Host;

pub trait TokenMap: Send + Sync + std::fmt::Debug {
    /// Records a host's token ownership. Does not rebuild the ring.
    fn add_host(&self, host: &Arc<Host>);

    /// Removes a host and rebuilds the ring.
    fn remove_host_and_build(&self, host: &Arc<Host>);

    /// Applies new keyspace replication settings and rebuilds.
    fn update_keyspaces_and_build(&self);

    /// Rebuilds the ring from the recorded hosts.
    fn build(&self);

    /// Drops replica sets and replication strategies, keeping host tokens.
    fn clear_replicas_and_strategies(&self);
}
