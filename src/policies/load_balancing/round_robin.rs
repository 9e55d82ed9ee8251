use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::cluster::host::{Host, HostDistance, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::network::transport::Request;
use crate::policies::load_balancing::{LoadBalancingPolicy, QueryPlan};

/// Plain round-robin over every known host, no datacenter awareness.
///
/// Each plan starts one position after the previous one, so load spreads
/// evenly across the cluster. Hosts that are currently down are skipped at
/// plan creation time.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    hosts: RwLock<Vec<Arc<Host>>>,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_host(&self, host: &Arc<Host>) {
        let mut hosts = self.hosts.write().unwrap();
        if !hosts.iter().any(|h| h.address == host.address) {
            hosts.push(Arc::clone(host));
        }
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, _current_host: Option<&Arc<Host>>, hosts: &HostMap) {
        let mut ordered: Vec<Arc<Host>> = hosts.values().cloned().collect();
        ordered.sort_unstable_by_key(|host| host.address);
        *self.hosts.write().unwrap() = ordered;

        // Start from a random position so that sessions created at the same
        // time don't all hammer the same host first.
        let len = self.hosts.read().unwrap().len();
        if len > 0 {
            self.index
                .store(rand::rng().random_range(0..len), Ordering::Relaxed);
        }
    }

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(
        &self,
        _keyspace: Option<&str>,
        _request: &Request,
        _token_map: Option<&Arc<dyn TokenMap>>,
    ) -> QueryPlan {
        let hosts = self.hosts.read().unwrap().clone();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }

        let start = self.index.fetch_add(1, Ordering::Relaxed) % hosts.len();
        let len = hosts.len();
        Box::new(
            (0..len)
                .map(move |offset| Arc::clone(&hosts[(start + offset) % len]))
                .filter(|host| host.is_up()),
        )
    }

    fn on_add(&self, host: &Arc<Host>) {
        self.add_host(host);
    }

    fn on_up(&self, host: &Arc<Host>) {
        // An upped host we never heard of is treated as an add.
        self.add_host(host);
    }

    fn on_down(&self, _host: &Arc<Host>) {}

    fn on_remove(&self, host: &Arc<Host>) {
        self.hosts
            .write()
            .unwrap()
            .retain(|h| h.address != host.address);
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn host(last_octet: u8) -> Arc<Host> {
        let address: SocketAddr = format!("127.0.0.{}:9042", last_octet).parse().unwrap();
        let host = Arc::new(Host::new(address));
        host.set_up();
        host
    }

    fn init_policy(hosts: &[Arc<Host>]) -> RoundRobinPolicy {
        let policy = RoundRobinPolicy::new();
        let map: HashMap<_, _> = hosts
            .iter()
            .map(|h| (h.address, Arc::clone(h)))
            .collect();
        policy.init(None, &map);
        policy
    }

    fn plan_addresses(policy: &RoundRobinPolicy) -> Vec<SocketAddr> {
        policy
            .new_query_plan(None, &Request::SchemaVersions, None)
            .map(|h| h.address)
            .collect()
    }

    #[test]
    fn rotates_across_plans() {
        let hosts = [host(1), host(2), host(3)];
        let policy = init_policy(&hosts);

        let first = plan_addresses(&policy);
        let second = plan_addresses(&policy);
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        // The second plan starts one host after the first.
        assert_eq!(second[0], first[1]);
        assert_eq!(second[1], first[2]);
        assert_eq!(second[2], first[0]);
    }

    #[test]
    fn skips_down_hosts() {
        let hosts = [host(1), host(2), host(3)];
        hosts[1].set_down();
        let policy = init_policy(&hosts);

        for _ in 0..3 {
            let plan = plan_addresses(&policy);
            assert_eq!(plan.len(), 2);
            assert!(!plan.contains(&hosts[1].address));
        }
    }

    #[test]
    fn duplicate_adds_are_absorbed() {
        let hosts = [host(1), host(2)];
        let policy = init_policy(&hosts);

        let newcomer = host(3);
        policy.on_add(&newcomer);
        policy.on_add(&newcomer);
        policy.on_up(&newcomer);

        assert_eq!(plan_addresses(&policy).len(), 3);
    }

    #[test]
    fn removed_hosts_leave_the_rotation() {
        let hosts = [host(1), host(2), host(3)];
        let policy = init_policy(&hosts);
        policy.on_remove(&hosts[0]);
        let plan = plan_addresses(&policy);
        assert_eq!(plan.len(), 2);
        assert!(!plan.contains(&hosts[0].address));
    }
}
