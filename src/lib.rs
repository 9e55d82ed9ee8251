//! Connection pooling and request dispatch core for a wide-column database
//! driver.
//!
//! This crate implements the client-side machinery between an application and
//! a wide-column cluster: a [`Session`] maintains per-host connection pools
//! over every reachable node, accepts asynchronous requests, selects hosts
//! through a pluggable [load balancing policy](crate::policies::load_balancing),
//! writes each request onto the least busy connection of the chosen host, and
//! orchestrates the auxiliary flows around request execution — reconnecting
//! broken connections with backoff, propagating prepared statements to all
//! hosts, and waiting for schema agreement after DDL.
//!
//! The wire protocol itself is not part of this crate: connections are
//! produced by a pluggable [`Connector`](crate::network::Connector) which
//! owns framing, TLS and authentication, and cluster topology events come
//! from a pluggable [`ControlConnector`](crate::cluster::ControlConnector).
//!
//! # Connecting and executing
//! ```rust,no_run
//! use cql_dispatch::{Session, SessionConfig, Statement};
//! # use std::sync::Arc;
//! # async fn example(
//! #     connector: Arc<dyn cql_dispatch::network::Connector>,
//! #     control: Arc<dyn cql_dispatch::cluster::ControlConnector>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SessionConfig::new(connector, control);
//! config.add_known_node("127.0.0.1:9042");
//!
//! let session = Session::new(config);
//! session.connect(None).await?;
//!
//! let response = session.execute(Statement::new("SELECT 1")).await?;
//! println!("served by {}", response.coordinator);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod errors;
pub mod execution;
pub mod network;
pub mod observability;
pub mod policies;
pub mod statement;

pub(crate) mod utils;

pub use client::execution_profile::ExecutionProfile;
pub use client::session::Session;
pub use client::SessionConfig;
pub use execution::QueryResponse;
pub use observability::metrics::Metrics;
pub use statement::{Consistency, PreparedStatement, Statement};
