use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

/// Engine-wide counters.
///
/// Every counter is an atomic so the fetch path and the workers can record
/// without coordination. Read a consistent-enough view with [`snapshot`].
///
/// [`snapshot`]: EngineMetrics::snapshot
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Requests
    /// Requests that produced a body
    pub requests_total: AtomicU64,
    /// Requests that failed for any reason
    pub request_errors: AtomicU64,
    /// Requests refused by an open breaker before reaching the network
    pub requests_short_circuited: AtomicU64,
    /// Requests that hit the adaptive timeout
    pub request_timeouts: AtomicU64,
    /// Bytes received from the network
    pub bytes_received: AtomicU64,
    /// Sum of successful request latencies in milliseconds
    pub latency_sum_ms: AtomicU64,

    // Segments
    pub segments_completed: AtomicU64,
    pub segments_failed: AtomicU64,
    pub segment_retries: AtomicU64,
    pub segments_resumed: AtomicU64,

    // Decryption
    pub decryptions_total: AtomicU64,
    pub decryption_bytes_total: AtomicU64,
    pub decryption_time_sum_us: AtomicU64,

    // Key cache
    pub key_cache_hits: AtomicU64,
    pub key_cache_misses: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub request_errors: u64,
    pub requests_short_circuited: u64,
    pub request_timeouts: u64,
    pub bytes_received: u64,
    pub average_latency_ms: Option<f64>,
    pub segments_completed: u64,
    pub segments_failed: u64,
    pub segment_retries: u64,
    pub segments_resumed: u64,
    pub decryptions_total: u64,
    pub decryption_bytes_total: u64,
    pub key_cache_hit_rate: f64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, bytes: u64, latency: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_request_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_short_circuit(&self) {
        self.requests_short_circuited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_completed(&self) {
        self.segments_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_failed(&self) {
        self.segments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_retry(&self) {
        self.segment_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segments_resumed(&self, count: u64) {
        self.segments_resumed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_decryption(&self, bytes: u64, elapsed: Duration) {
        self.decryptions_total.fetch_add(1, Ordering::Relaxed);
        self.decryption_bytes_total
            .fetch_add(bytes, Ordering::Relaxed);
        self.decryption_time_sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_key_cache_hit(&self) {
        self.key_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_cache_miss(&self) {
        self.key_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Average latency of successful requests, `None` before the first one.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let total = self.requests_total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let sum = self.latency_sum_ms.load(Ordering::Relaxed);
        Some(sum as f64 / total as f64)
    }

    /// Key cache hit rate in `0.0..=1.0`.
    pub fn key_cache_hit_rate(&self) -> f64 {
        let hits = self.key_cache_hits.load(Ordering::Relaxed);
        let misses = self.key_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            requests_short_circuited: self.requests_short_circuited.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            segments_completed: self.segments_completed.load(Ordering::Relaxed),
            segments_failed: self.segments_failed.load(Ordering::Relaxed),
            segment_retries: self.segment_retries.load(Ordering::Relaxed),
            segments_resumed: self.segments_resumed.load(Ordering::Relaxed),
            decryptions_total: self.decryptions_total.load(Ordering::Relaxed),
            decryption_bytes_total: self.decryption_bytes_total.load(Ordering::Relaxed),
            key_cache_hit_rate: self.key_cache_hit_rate(),
        }
    }

    /// Log a one-line summary at info level.
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        info!(
            requests = snap.requests_total,
            errors = snap.request_errors,
            short_circuited = snap.requests_short_circuited,
            timeouts = snap.request_timeouts,
            bytes = snap.bytes_received,
            avg_latency_ms = snap.average_latency_ms.unwrap_or(0.0),
            segments = snap.segments_completed,
            retries = snap.segment_retries,
            "Engine metrics"
        );
    }
}

/// Sliding-window throughput estimate for one task.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }

    /// Bytes per second over the window.
    pub fn bytes_per_sec(&mut self) -> f64 {
        let now = Instant::now();
        self.evict(now);
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        // a single burst still reports a rate over at least one second
        let span = now.duration_since(first).max(Duration::from_secs(1));
        self.window_bytes as f64 / span.as_secs_f64()
    }

    /// Remaining time from the byte rate and the average segment size so far.
    pub fn eta(
        &mut self,
        completed: u64,
        total: u64,
        bytes_so_far: u64,
    ) -> Option<Duration> {
        if completed == 0 || completed >= total {
            return None;
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        let avg_segment = bytes_so_far as f64 / completed as f64;
        let remaining = avg_segment * (total - completed) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_are_none_or_zero_before_samples() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.average_latency_ms(), None);
        assert_eq!(metrics.key_cache_hit_rate(), 0.0);
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_request(1_000, Duration::from_millis(100));
        metrics.record_request(3_000, Duration::from_millis(300));
        metrics.record_request_error();
        metrics.record_key_cache_miss();
        metrics.record_key_cache_hit();
        metrics.record_key_cache_hit();
        metrics.record_key_cache_hit();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.bytes_received, 4_000);
        assert_eq!(snap.request_errors, 1);
        assert_eq!(snap.average_latency_ms, Some(200.0));
        assert_eq!(snap.key_cache_hit_rate, 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_meter_drops_samples_outside_window() {
        let mut meter = SpeedMeter::new(Duration::from_secs(5));
        meter.record(10_000);
        tokio::time::advance(Duration::from_secs(2)).await;
        meter.record(10_000);
        assert_eq!(meter.bytes_per_sec(), 10_000.0);

        tokio::time::advance(Duration::from_secs(4)).await;
        // first sample is now 6s old
        assert_eq!(meter.bytes_per_sec(), 2_500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn eta_uses_average_segment_size() {
        let mut meter = SpeedMeter::new(Duration::from_secs(10));
        meter.record(1_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        meter.record(1_000);
        // 2000 bytes over 1s, 8 segments of 1000 bytes left
        assert_eq!(meter.eta(2, 10, 2_000), Some(Duration::from_secs(4)));
        assert_eq!(meter.eta(10, 10, 10_000), None);
    }
}
