use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{Duration, Instant};
use tracing::warn;

/// Trait used to represent a client-side timestamp generator.
pub trait TimestampGenerator: Send + Sync {
    /// This generates a new timestamp, in microseconds since the UNIX epoch.
    fn next_timestamp(&self) -> i64;
}

/// Timestamp generator that never goes backwards.
///
/// Timestamps normally track the system clock. Whenever the clock stalls or
/// jumps back, the generator keeps issuing one microsecond past the highest
/// value it has handed out, and warns about how far ahead of the clock it is
/// running, at most once per warning interval. The guarantee only holds
/// within one instance of this struct.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    last_warning: Mutex<Instant>,
    warning_threshold: Duration,
    warning_interval: Duration,
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        MonotonicTimestampGenerator {
            last: AtomicI64::new(0),
            last_warning: Mutex::new(Instant::now()),
            warning_threshold: Duration::from_secs(1),
            warning_interval: Duration::from_secs(1),
        }
    }

    pub fn with_warning_times(
        mut self,
        warning_threshold: Duration,
        warning_interval: Duration,
    ) -> Self {
        self.warning_threshold = warning_threshold;
        self.warning_interval = warning_interval;
        self
    }

    fn clock_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0)
    }

    // `ahead_by` is how far past the system clock the issued timestamp is.
    fn maybe_warn_about_drift(&self, ahead_by: i64) {
        if ahead_by <= self.warning_threshold.as_micros() as i64 {
            return;
        }
        let mut last_warning = self.last_warning.lock().unwrap();
        if last_warning.elapsed() >= self.warning_interval {
            *last_warning = Instant::now();
            drop(last_warning);
            warn!(
                "Timestamps are running {} microseconds ahead of the system \
                clock (the clock stalled or moved backwards); incrementing \
                artificially to stay monotonic",
                ahead_by
            );
        }
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        MonotonicTimestampGenerator::new()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        let now = Self::clock_micros();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .unwrap_or_else(|observed| observed);

        let issued = if now > previous { now } else { previous + 1 };
        if issued > now {
            self.maybe_warn_about_drift(issued - now);
        }
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_timestamps_strictly_increase() {
        let generator = MonotonicTimestampGenerator::new();
        let mut previous = generator.next_timestamp();
        for _ in 0..10_000 {
            let next = generator.next_timestamp();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn timestamps_advance_past_a_stalled_clock() {
        let generator = MonotonicTimestampGenerator::new();
        // Force the generator far ahead of the real clock; every subsequent
        // timestamp must still increase by at least one.
        let far_ahead = MonotonicTimestampGenerator::clock_micros() + 10_000_000;
        generator.last.store(far_ahead, Ordering::Release);

        assert_eq!(generator.next_timestamp(), far_ahead + 1);
        assert_eq!(generator.next_timestamp(), far_ahead + 2);
    }
}
