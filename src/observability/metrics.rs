use histogram::{AtomicHistogram, Histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Error that occurred upon a metrics operation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Histogram error: {0}")]
    HistogramError(#[from] Arc<dyn std::error::Error + Send + Sync>),
    #[error("Histogram is empty")]
    Empty,
}

/// Counters and a latency histogram maintained by the dispatch core.
pub struct Metrics {
    requests_num: AtomicU64,
    errors_num: AtomicU64,
    retries_num: AtomicU64,
    connection_timeouts: AtomicU64,
    request_timeouts: AtomicU64,
    queue_full_errors: AtomicU64,
    total_connections: AtomicU64,
    histogram: Arc<AtomicHistogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Increments counter for sent requests.
    pub(crate) fn inc_total_requests(&self) {
        self.requests_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for failed request attempts.
    pub(crate) fn inc_failed_requests(&self) {
        self.errors_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter measuring how many times a retry policy has decided
    /// to retry a request.
    pub(crate) fn inc_retries_num(&self) {
        self.retries_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for connection attempts that timed out.
    pub(crate) fn inc_connection_timeouts(&self) {
        self.connection_timeouts.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for requests that timed out waiting for a response.
    pub(crate) fn inc_request_timeouts(&self) {
        self.request_timeouts.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for requests rejected because the request queue was
    /// full.
    pub(crate) fn inc_queue_full_errors(&self) {
        self.queue_full_errors.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn dec_total_connections(&self) {
        self.total_connections.fetch_sub(1, ORDER_TYPE);
    }

    /// Saves to histogram the latency of completing a single request attempt.
    ///
    /// # Arguments
    ///
    /// * `latency` - time in milliseconds that should be logged
    pub(crate) fn log_request_latency(&self, latency: u64) -> Result<(), MetricsError> {
        if let Err(err) = self.histogram.increment(latency) {
            Err(MetricsError::HistogramError(Arc::new(err)))
        } else {
            Ok(())
        }
    }

    /// Returns average latency in milliseconds.
    pub fn get_latency_avg_ms(&self) -> Result<u64, MetricsError> {
        Self::mean(&self.histogram.load())
    }

    /// Returns latency from the histogram for a given percentile.
    ///
    /// # Arguments
    ///
    /// * `percentile` - float value (0.0 - 100.0)
    pub fn get_latency_percentile_ms(&self, percentile: f64) -> Result<u64, MetricsError> {
        let res = self.histogram.load().percentile(percentile);
        match res {
            Err(err) => Err(MetricsError::HistogramError(Arc::new(err))),
            Ok(None) => Err(MetricsError::Empty),
            Ok(Some(p)) => Ok(p.count()),
        }
    }

    pub fn get_requests_num(&self) -> u64 {
        self.requests_num.load(ORDER_TYPE)
    }

    pub fn get_errors_num(&self) -> u64 {
        self.errors_num.load(ORDER_TYPE)
    }

    pub fn get_retries_num(&self) -> u64 {
        self.retries_num.load(ORDER_TYPE)
    }

    pub fn get_connection_timeouts(&self) -> u64 {
        self.connection_timeouts.load(ORDER_TYPE)
    }

    pub fn get_request_timeouts(&self) -> u64 {
        self.request_timeouts.load(ORDER_TYPE)
    }

    pub fn get_queue_full_errors(&self) -> u64 {
        self.queue_full_errors.load(ORDER_TYPE)
    }

    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(ORDER_TYPE)
    }

    // The histogram only keeps bucket counts, so every sample is estimated
    // by the middle of the bucket it landed in.
    fn mean(h: &Histogram) -> Result<u64, MetricsError> {
        let (total, samples) = h.into_iter().fold((0u128, 0u128), |(total, samples), bucket| {
            let estimate = (bucket.start() as u128 + bucket.end() as u128) / 2;
            (
                total + estimate * bucket.count() as u128,
                samples + bucket.count() as u128,
            )
        });

        if samples == 0 {
            return Err(MetricsError::Empty);
        }
        Ok((total / samples) as u64)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // Latencies are recorded in milliseconds, so a 2^16 value range
        // covers about a minute; 12 grouping bits keep the buckets narrow
        // enough for sub-percent error at a modest memory cost.
        let max_value_power = 16;
        let grouping_power = 12;

        Self {
            requests_num: AtomicU64::new(0),
            errors_num: AtomicU64::new(0),
            retries_num: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            queue_full_errors: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            histogram: Arc::new(AtomicHistogram::new(grouping_power, max_value_power).unwrap()),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests_num", &self.requests_num)
            .field("errors_num", &self.errors_num)
            .field("retries_num", &self.retries_num)
            .field("connection_timeouts", &self.connection_timeouts)
            .field("request_timeouts", &self.request_timeouts)
            .field("queue_full_errors", &self.queue_full_errors)
            .field("total_connections", &self.total_connections)
            .finish_non_exhaustive()
    }
}
