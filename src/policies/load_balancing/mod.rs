//! Load balancing configurations\
//! A request processor can use any load balancing policy which implements the
//! `LoadBalancingPolicy` trait to decide which hosts to contact for each
//! request.

use std::sync::Arc;

use crate::cluster::host::{Host, HostDistance, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::network::transport::Request;

mod round_robin;
pub use round_robin::RoundRobinPolicy;

/// An ordered iterator of hosts to try for one request, best candidates
/// first.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// Policy that decides which hosts to contact for each request.
///
/// A policy instance is shared between all request processors of a session;
/// implementations must be thread-safe and must absorb duplicate topology
/// notifications (each processor forwards the changes it observes).
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Called once during session initialization with the host the control
    /// connection picked and the full host set.
    fn init(&self, current_host: Option<&Arc<Host>>, hosts: &HostMap);

    /// Classifies a host. Processors skip `Ignore`d hosts when forwarding
    /// up/down/add notifications to the policy.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Produces the host order for one request.
    fn new_query_plan(
        &self,
        keyspace: Option<&str>,
        request: &Request,
        token_map: Option<&Arc<dyn TokenMap>>,
    ) -> QueryPlan;

    fn on_add(&self, host: &Arc<Host>);
    fn on_up(&self, host: &Arc<Host>);
    fn on_down(&self, host: &Arc<Host>);
    fn on_remove(&self, host: &Arc<Host>);

    /// Returns the name of the load balancing policy.
    fn name(&self) -> String;
}
