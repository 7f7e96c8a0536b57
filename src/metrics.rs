//! Prometheus metrics (lock-free atomics, zero allocation on hot path).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // --- Traffic ---
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub retries_total: AtomicU64,
    pub upstream_errors: AtomicU64,

    // --- Latency (μs, updated via CAS) ---
    pub request_duration_us_sum: AtomicU64,
    pub request_duration_us_max: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            request_duration_us_sum: AtomicU64::new(0),
            request_duration_us_max: AtomicU64::new(0),
        }
    }

    pub fn record_request_duration(&self, start: Instant) {
        let us = start.elapsed().as_micros() as u64;
        self.request_duration_us_sum.fetch_add(us, Ordering::Relaxed);
        // CAS loop for max tracking
        let mut cur = self.request_duration_us_max.load(Ordering::Relaxed);
        while us > cur {
            match self.request_duration_us_max.compare_exchange_weak(
                cur,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn render(
        &self,
        api_valid: usize,
        api_total: usize,
        vertex_valid: usize,
        vertex_total: usize,
    ) -> String {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let requests_success = self.requests_success.load(Ordering::Relaxed);
        let requests_error = self.requests_error.load(Ordering::Relaxed);
        let retries_total = self.retries_total.load(Ordering::Relaxed);
        let upstream_errors = self.upstream_errors.load(Ordering::Relaxed);
        let dur_sum = self.request_duration_us_sum.load(Ordering::Relaxed);
        let dur_max = self.request_duration_us_max.swap(0, Ordering::Relaxed);

        // Convert μs to seconds for Prometheus conventions
        let dur_sum_s = dur_sum as f64 / 1_000_000.0;
        let dur_max_s = dur_max as f64 / 1_000_000.0;

        format!(
            "\
# HELP relay_requests_total Total proxy requests received.\n\
# TYPE relay_requests_total counter\n\
relay_requests_total {requests_total}\n\
# HELP relay_requests_success_total Requests answered from upstream.\n\
# TYPE relay_requests_success_total counter\n\
relay_requests_success_total {requests_success}\n\
# HELP relay_requests_error_total Requests that failed after retries.\n\
# TYPE relay_requests_error_total counter\n\
relay_requests_error_total {requests_error}\n\
# HELP relay_retries_total Key rotations after a failed attempt.\n\
# TYPE relay_retries_total counter\n\
relay_retries_total {retries_total}\n\
# HELP relay_upstream_errors_total Individual upstream attempt failures.\n\
# TYPE relay_upstream_errors_total counter\n\
relay_upstream_errors_total {upstream_errors}\n\
# HELP relay_request_duration_seconds_sum Total handler time (seconds).\n\
# TYPE relay_request_duration_seconds_sum counter\n\
relay_request_duration_seconds_sum {dur_sum_s:.6}\n\
# HELP relay_request_duration_seconds_max Max handler time since last scrape (seconds).\n\
# TYPE relay_request_duration_seconds_max gauge\n\
relay_request_duration_seconds_max {dur_max_s:.6}\n\
# HELP relay_api_keys_valid Primary keys below the failure threshold.\n\
# TYPE relay_api_keys_valid gauge\n\
relay_api_keys_valid {api_valid}\n\
# HELP relay_api_keys_total Primary keys configured.\n\
# TYPE relay_api_keys_total gauge\n\
relay_api_keys_total {api_total}\n\
# HELP relay_vertex_keys_valid Auxiliary keys below the failure threshold.\n\
# TYPE relay_vertex_keys_valid gauge\n\
relay_vertex_keys_valid {vertex_valid}\n\
# HELP relay_vertex_keys_total Auxiliary keys configured.\n\
# TYPE relay_vertex_keys_total gauge\n\
relay_vertex_keys_total {vertex_total}\n"
        )
    }
}
