//! Cluster nodes as seen by the dispatch core.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;

/// Lifecycle state of a host.
///
/// A host starts as `Created`, is set `Up` once its pool establishes a
/// connection, oscillates between `Up` and `Down` with availability, and ends
/// as `Removed` when the topology drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostState {
    Created = 0,
    Up = 1,
    Down = 2,
    Removed = 3,
}

impl HostState {
    fn from_u8(raw: u8) -> HostState {
        match raw {
            0 => HostState::Created,
            1 => HostState::Up,
            2 => HostState::Down,
            _ => HostState::Removed,
        }
    }
}

/// Distance of a host as decided by a load balancing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    /// The policy will never route requests to this host and does not want
    /// to hear about its state changes.
    Ignore,
}

/// One cluster node. Identity is the socket address.
#[derive(Debug)]
pub struct Host {
    /// Address used to connect to the node.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,

    state: AtomicU8,

    // Contact-point hosts are marked on session bootstrap; hosts still marked
    // after the control connection delivers the authoritative host set are
    // purged.
    mark: AtomicBool,
}

/// How hosts are keyed and passed around the core.
pub type HostMap = HashMap<SocketAddr, Arc<Host>>;

impl Host {
    pub fn new(address: SocketAddr) -> Self {
        Host {
            address,
            datacenter: None,
            rack: None,
            state: AtomicU8::new(HostState::Created as u8),
            mark: AtomicBool::new(false),
        }
    }

    pub fn with_metadata(
        address: SocketAddr,
        datacenter: Option<String>,
        rack: Option<String>,
    ) -> Self {
        Host {
            datacenter,
            rack,
            ..Host::new(address)
        }
    }

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }

    /// Transitions the host to `Up`. Returns `false` if the state did not
    /// change (the host was already up, or was removed).
    pub fn set_up(&self) -> bool {
        self.transition(HostState::Up)
    }

    /// Transitions the host to `Down`. Returns `false` if the state did not
    /// change.
    pub fn set_down(&self) -> bool {
        self.transition(HostState::Down)
    }

    /// Marks the host as removed from the cluster. Terminal.
    pub fn set_removed(&self) {
        self.state
            .store(HostState::Removed as u8, Ordering::Release);
    }

    fn transition(&self, target: HostState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = HostState::from_u8(current);
            if state == target || state == HostState::Removed {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn set_mark(&self, mark: bool) {
        self.mark.store(mark, Ordering::Release);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Describes a database server known on `Session` startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname (optionally with a port).
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

const DEFAULT_PORT: u16 = 9042;

async fn lookup_with_timeout(
    target: impl ToSocketAddrs,
    timeout: Option<Duration>,
) -> std::io::Result<impl Iterator<Item = SocketAddr>> {
    let lookup = lookup_host(target);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, lookup)
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("DNS lookup exceeded {} ms", limit.as_millis()),
                ))
            }),
        None => lookup.await,
    }
}

// Any IPv4 candidate wins; otherwise settle for the last one seen.
fn preferred_address(
    candidates: impl Iterator<Item = SocketAddr>,
    hostname: &str,
) -> std::io::Result<SocketAddr> {
    let mut fallback = None;
    for candidate in candidates {
        if candidate.is_ipv4() {
            return Ok(candidate);
        }
        fallback = Some(candidate);
    }
    fallback.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("DNS returned no addresses for {}", hostname),
        )
    })
}

// Accepts both "host:port" pairs and bare hostnames. A bare name makes the
// first lookup fail immediately, so it is retried with the default port
// appended; a timeout is final either way.
async fn resolve_hostname(
    hostname: &str,
    timeout: Option<Duration>,
) -> std::io::Result<SocketAddr> {
    let candidates = match lookup_with_timeout(hostname, timeout).await {
        Ok(candidates) => itertools::Either::Left(candidates),
        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return Err(err),
        Err(err) => match lookup_with_timeout((hostname, DEFAULT_PORT), timeout).await {
            Ok(candidates) => itertools::Either::Right(candidates),
            // Report the first failure; the port-appending retry was only a
            // guess at what the caller meant.
            Err(_) => return Err(err),
        },
    };
    preferred_address(candidates, hostname)
}

/// Resolves the configured contact points into socket addresses.
///
/// Hostname lookups run concurrently. Hostnames that fail to resolve are
/// logged and skipped; the caller gets them back next to the addresses that
/// did resolve.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut resolved: Vec<SocketAddr> = Vec::with_capacity(known_nodes.len());
    let mut hostnames: Vec<&String> = Vec::new();
    for node in known_nodes {
        match node {
            KnownNode::Address(address) => resolved.push(*address),
            KnownNode::Hostname(hostname) => hostnames.push(hostname),
        }
    }

    let lookups = hostnames.iter().map(|hostname| async move {
        resolve_hostname(hostname, hostname_resolution_timeout)
            .await
            .map_err(|err| {
                warn!("[{}] Contact point hostname did not resolve: {}", hostname, err);
                hostname.to_string()
            })
    });

    let mut unresolved = Vec::new();
    for outcome in futures::future::join_all(lookups).await {
        match outcome {
            Ok(address) => resolved.push(address),
            Err(hostname) => unresolved.push(hostname),
        }
    }

    (resolved, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host::new("127.0.0.1:9042".parse().unwrap())
    }

    #[test]
    fn state_transitions() {
        let host = host();
        assert_eq!(host.state(), HostState::Created);

        assert!(host.set_up());
        assert_eq!(host.state(), HostState::Up);
        // Redundant transition is a no-op.
        assert!(!host.set_up());

        assert!(host.set_down());
        assert_eq!(host.state(), HostState::Down);
        assert!(host.set_up());

        host.set_removed();
        assert_eq!(host.state(), HostState::Removed);
        // Removed is terminal.
        assert!(!host.set_up());
        assert!(!host.set_down());
        assert_eq!(host.state(), HostState::Removed);
    }

    #[test]
    fn identity_is_the_address() {
        let a = Host::new("127.0.0.1:9042".parse().unwrap());
        let b = Host::with_metadata(
            "127.0.0.1:9042".parse().unwrap(),
            Some("dc1".into()),
            Some("r1".into()),
        );
        let c = Host::new("127.0.0.2:9042".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn resolves_plain_addresses_without_dns() {
        let nodes = vec![
            KnownNode::Address("127.0.0.1:9042".parse().unwrap()),
            KnownNode::Address("127.0.0.2:19042".parse().unwrap()),
        ];
        let (resolved, failed) = resolve_contact_points(&nodes, None).await;
        assert_eq!(resolved.len(), 2);
        assert!(failed.is_empty());
    }
}
