//! Session configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control::ControlConnector;
use crate::cluster::host::KnownNode;
use crate::cluster::token_map::TokenMap;
use crate::network::transport::Connector;
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::timestamp_generator::{MonotonicTimestampGenerator, TimestampGenerator};

/// Configuration of a [`Session`](crate::client::session::Session).
/// Immutable once the session connects.
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Cluster nodes tried on connect. At least one is required.
    pub contact_points: Vec<KnownNode>,

    /// Opens the data connections.
    pub connector: Arc<dyn Connector>,

    /// Opens the control connection and delivers topology events.
    pub control: Arc<dyn ControlConnector>,

    /// Target number of connections each pool keeps per host.
    pub num_connections_per_host: NonZeroUsize,

    /// Number of request processors draining the request queue.
    pub request_processor_count: NonZeroUsize,

    /// Capacity of the bounded request queue shared by the processors.
    pub request_queue_size: usize,

    /// Propagate successful prepares to every available host.
    pub prepare_on_all_hosts: bool,

    /// Treat a pool's critical error as the host going down.
    pub down_host_on_critical_error: bool,

    /// How long a schema-changing statement waits for every peer to report
    /// the same schema version before resolving anyway.
    pub max_schema_wait_time: Duration,

    /// Interval between schema version polls.
    pub schema_agreement_interval: Duration,

    /// Per-lookup timeout for resolving hostname contact points.
    pub hostname_resolution_timeout: Option<Duration>,

    /// Profile used by requests that don't name one.
    pub default_execution_profile: ExecutionProfile,

    /// Profiles requests can select by name.
    pub execution_profiles: HashMap<String, ExecutionProfile>,

    /// Backoff between reconnect attempts of a pool slot.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// Source of client-side timestamps attached to requests.
    pub timestamp_generator: Arc<dyn TimestampGenerator>,

    /// Token map handed to token-aware load balancing policies, if any.
    pub token_map: Option<Arc<dyn TokenMap>>,
}

impl SessionConfig {
    /// Creates a config with default options and no contact points.
    pub fn new(connector: Arc<dyn Connector>, control: Arc<dyn ControlConnector>) -> Self {
        SessionConfig {
            contact_points: Vec::new(),
            connector,
            control,
            num_connections_per_host: NonZeroUsize::new(1).unwrap(),
            request_processor_count: NonZeroUsize::new(1).unwrap(),
            request_queue_size: 8192,
            prepare_on_all_hosts: true,
            down_host_on_critical_error: true,
            max_schema_wait_time: Duration::from_secs(10),
            schema_agreement_interval: Duration::from_millis(200),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            default_execution_profile: ExecutionProfile::default(),
            execution_profiles: HashMap::new(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            timestamp_generator: Arc::new(MonotonicTimestampGenerator::new()),
            token_map: None,
        }
    }

    /// Adds a contact point. A parseable `ip:port` is used as an address,
    /// anything else is treated as a hostname to resolve.
    pub fn add_known_node(&mut self, node: impl AsRef<str>) {
        let node = node.as_ref();
        match node.parse::<SocketAddr>() {
            Ok(address) => self.contact_points.push(KnownNode::Address(address)),
            Err(_) => self
                .contact_points
                .push(KnownNode::Hostname(node.to_string())),
        }
    }

    pub fn add_known_nodes(&mut self, nodes: impl IntoIterator<Item = impl AsRef<str>>) {
        for node in nodes {
            self.add_known_node(node);
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("contact_points", &self.contact_points)
            .field("num_connections_per_host", &self.num_connections_per_host)
            .field("request_processor_count", &self.request_processor_count)
            .field("request_queue_size", &self.request_queue_size)
            .field("prepare_on_all_hosts", &self.prepare_on_all_hosts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{MockControl, MockTransport};

    #[test]
    fn known_nodes_parse_as_addresses_or_hostnames() {
        let transport = MockTransport::new();
        let mut config = SessionConfig::new(transport.connector(), MockControl::new(&[1]));
        config.add_known_node("127.0.0.1:9042");
        config.add_known_node("db.example.com");
        config.add_known_nodes(["10.0.0.7:19042"]);

        assert_eq!(config.contact_points.len(), 3);
        assert!(matches!(config.contact_points[0], KnownNode::Address(_)));
        assert!(matches!(config.contact_points[1], KnownNode::Hostname(_)));
        assert!(matches!(config.contact_points[2], KnownNode::Address(_)));
    }
}
