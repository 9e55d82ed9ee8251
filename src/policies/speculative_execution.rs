//! Speculative execution launches additional attempts for a request when the
//! current host takes too long to respond, trading extra load for tail
//! latency. Only idempotent requests are eligible.

use std::time::Duration;

/// The policy that decides if the driver will send speculative attempts to
/// the next hosts of the query plan when the current one is slow.
pub trait SpeculativeExecutionPolicy: Send + Sync + std::fmt::Debug {
    /// The maximum number of speculative attempts that will be launched for a
    /// given request (does not include the initial attempt).
    fn max_attempt_count(&self) -> usize;

    /// The delay between each speculative attempt.
    fn retry_interval(&self) -> Duration;
}

/// A [`SpeculativeExecutionPolicy`] that schedules a given number of
/// speculative attempts, separated by a fixed delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_attempt_count: usize,
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_attempt_count(&self) -> usize {
        self.max_attempt_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}
