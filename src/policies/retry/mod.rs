//! Request retries configurations\
//! To decide when to retry a request the processor can use any object which
//! implements the `RetryPolicy` trait.

use crate::errors::RequestError;
use crate::statement::Consistency;

mod default;
pub use default::DefaultRetryPolicy;

/// Information about a failed request attempt.
pub struct RequestInfo<'a> {
    /// The error with which the attempt failed.
    pub error: &'a RequestError,
    /// Whether the request can be applied multiple times without changing the
    /// outcome. Only `true` allows retrying errors where the request may have
    /// been applied.
    pub is_idempotent: bool,
    /// Consistency with which the attempt was made.
    pub consistency: Consistency,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host. `None` keeps the consistency of the failed
    /// attempt.
    RetrySameHost(Option<Consistency>),
    /// Advance to the next host in the query plan.
    RetryNextHost(Option<Consistency>),
    DontRetry,
}

/// Specifies a policy used to decide when to retry a request.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Called for each new request, starts a session of deciding about retries.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide when to retry it.
pub trait RetrySession: Send {
    /// Called after an attempt failed - decide what to do next.
    fn decide_should_retry(&mut self, request_info: RequestInfo<'_>) -> RetryDecision;
}
