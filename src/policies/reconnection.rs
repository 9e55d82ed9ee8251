//! Reconnection backoff policies.
//!
//! Every connection pool owns one [`ReconnectionSchedule`], advanced each time
//! a reconnect attempt fails and reset when one succeeds.

use std::time::Duration;

/// Decides how long a pool waits between reconnect attempts.
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send>;
}

/// Per-pool backoff state produced by a [`ReconnectionPolicy`].
pub trait ReconnectionSchedule {
    /// Delay before the next reconnect attempt. Advances the schedule.
    fn next_delay(&mut self) -> Duration;

    /// Called after a successful reconnect; the next failure starts from the
    /// initial delay again.
    fn reset(&mut self);
}

/// Waits a fixed delay between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        ConstantReconnectionPolicy { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// Doubles the delay on every failed attempt, bounded by a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ExponentialReconnectionPolicy {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        ExponentialReconnectionPolicy::new(Duration::from_millis(50), Duration::from_secs(10))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ExponentialSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            current_delay: self.base_delay,
        })
    }
}

struct ExponentialSchedule {
    base_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.max_delay, self.current_delay * 2);
        delay
    }

    fn reset(&mut self) {
        self.current_delay = self.base_delay;
    }
}
