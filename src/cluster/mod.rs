//! Cluster topology: hosts, the control connection interface and the token
//! map interface.

pub mod control;
pub mod host;
pub mod token_map;

pub use control::{ControlConnector, ControlEvent, ControlHandle};
pub use host::{Host, HostDistance, HostMap, HostState, KnownNode};
pub use token_map::TokenMap;
