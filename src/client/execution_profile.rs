//! `ExecutionProfile` is a grouping of configurable options regarding request
//! execution.
//!
//! Profiles can be created to represent different workloads, which can then
//! be run conveniently on a single session: requests name the profile to run
//! with, and the session keeps a map of named profiles next to the default
//! one.
//!
//! # Example
//! ```
//! use cql_dispatch::ExecutionProfile;
//! use cql_dispatch::statement::Consistency;
//!
//! let profile = ExecutionProfile::builder()
//!     .consistency(Consistency::LocalOne)
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::statement::Consistency;

pub(crate) mod defaults {
    use super::*;

    pub(crate) fn consistency() -> Consistency {
        Consistency::LocalQuorum
    }

    pub(crate) fn request_timeout() -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    pub(crate) fn load_balancing_policy() -> Arc<dyn LoadBalancingPolicy> {
        Arc::new(RoundRobinPolicy::new())
    }

    pub(crate) fn retry_policy() -> Arc<dyn RetryPolicy> {
        Arc::new(DefaultRetryPolicy::new())
    }

    pub(crate) fn speculative_execution_policy() -> Option<Arc<dyn SpeculativeExecutionPolicy>> {
        None
    }
}

#[derive(Debug)]
struct ExecutionProfileInner {
    consistency: Consistency,
    request_timeout: Option<Duration>,
    load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
}

/// An immutable bundle of per-request policies: consistency, load balancing,
/// retries and speculative execution.
#[derive(Debug, Clone)]
pub struct ExecutionProfile {
    inner: Arc<ExecutionProfileInner>,
}

impl ExecutionProfile {
    pub fn builder() -> ExecutionProfileBuilder {
        ExecutionProfileBuilder {
            consistency: None,
            request_timeout: None,
            load_balancing_policy: None,
            retry_policy: None,
            speculative_execution_policy: None,
        }
    }

    /// Creates a builder pre-populated with this profile's options.
    pub fn to_builder(&self) -> ExecutionProfileBuilder {
        ExecutionProfileBuilder {
            consistency: Some(self.inner.consistency),
            request_timeout: Some(self.inner.request_timeout),
            load_balancing_policy: Some(Arc::clone(&self.inner.load_balancing_policy)),
            retry_policy: Some(Arc::clone(&self.inner.retry_policy)),
            speculative_execution_policy: Some(self.inner.speculative_execution_policy.clone()),
        }
    }

    pub fn consistency(&self) -> Consistency {
        self.inner.consistency
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.inner.request_timeout
    }

    pub fn load_balancing_policy(&self) -> Arc<dyn LoadBalancingPolicy> {
        Arc::clone(&self.inner.load_balancing_policy)
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::clone(&self.inner.retry_policy)
    }

    pub fn speculative_execution_policy(&self) -> Option<Arc<dyn SpeculativeExecutionPolicy>> {
        self.inner.speculative_execution_policy.clone()
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        ExecutionProfile::builder().build()
    }
}

/// Builder for [`ExecutionProfile`]; unset options take the defaults.
pub struct ExecutionProfileBuilder {
    consistency: Option<Consistency>,
    request_timeout: Option<Option<Duration>>,
    load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    speculative_execution_policy: Option<Option<Arc<dyn SpeculativeExecutionPolicy>>>,
}

impl ExecutionProfileBuilder {
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// `None` disables the per-request timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing_policy = Some(policy);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn speculative_execution_policy(
        mut self,
        policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    ) -> Self {
        self.speculative_execution_policy = Some(policy);
        self
    }

    pub fn build(self) -> ExecutionProfile {
        ExecutionProfile {
            inner: Arc::new(ExecutionProfileInner {
                consistency: self.consistency.unwrap_or_else(defaults::consistency),
                request_timeout: self
                    .request_timeout
                    .unwrap_or_else(defaults::request_timeout),
                load_balancing_policy: self
                    .load_balancing_policy
                    .unwrap_or_else(defaults::load_balancing_policy),
                retry_policy: self.retry_policy.unwrap_or_else(defaults::retry_policy),
                speculative_execution_policy: self
                    .speculative_execution_policy
                    .unwrap_or_else(defaults::speculative_execution_policy),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let profile = ExecutionProfile::builder().build();
        assert_eq!(profile.consistency(), Consistency::LocalQuorum);
        assert!(profile.speculative_execution_policy().is_none());
    }

    #[test]
    fn to_builder_preserves_options() {
        let base = ExecutionProfile::builder()
            .consistency(Consistency::One)
            .build();
        let derived = base.to_builder().build();
        assert_eq!(derived.consistency(), Consistency::One);
        assert!(Arc::ptr_eq(
            &base.load_balancing_policy(),
            &derived.load_balancing_policy()
        ));
    }
}
