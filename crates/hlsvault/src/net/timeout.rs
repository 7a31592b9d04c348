use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::config::AdaptiveTimeoutConfig;

/// Latency summary for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub mean: Duration,
    pub stddev: Duration,
    pub samples: u64,
    /// Most recent raw samples, oldest first.
    pub recent: Vec<Duration>,
}

#[derive(Debug, Default)]
struct HostLatency {
    mean_ms: f64,
    var_ms2: f64,
    samples: u64,
    recent: VecDeque<Duration>,
}

impl HostLatency {
    fn record(&mut self, latency: Duration, alpha: f64, keep: usize) {
        let sample_ms = latency.as_secs_f64() * 1000.0;
        if self.samples == 0 {
            self.mean_ms = sample_ms;
            self.var_ms2 = (sample_ms / 2.0).powi(2);
        } else {
            let diff = sample_ms - self.mean_ms;
            self.mean_ms += alpha * diff;
            self.var_ms2 = (1.0 - alpha) * (self.var_ms2 + alpha * diff * diff);
        }
        self.samples += 1;

        if keep > 0 {
            if self.recent.len() == keep {
                self.recent.pop_front();
            }
            self.recent.push_back(latency);
        }
    }
}

/// Per-host timeout derived from an EWMA of observed latency.
///
/// `timeout_for` returns `mean + k * stddev` clamped to the configured bounds,
/// so slow-but-steady hosts get room while erratic hosts are cut off sooner
/// than a fixed ceiling would allow.
#[derive(Debug)]
pub struct AdaptiveTimeoutTracker {
    config: AdaptiveTimeoutConfig,
    hosts: DashMap<String, Mutex<HostLatency>>,
}

impl AdaptiveTimeoutTracker {
    pub fn new(config: AdaptiveTimeoutConfig) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
        }
    }

    /// Record the latency of a completed request, or the applied timeout for
    /// one that timed out.
    pub fn record(&self, host: &str, latency: Duration) {
        let entry = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(HostLatency::default()));
        let mut stats = entry.lock();
        stats.record(latency, self.config.alpha, self.config.sample_window);
        trace!(
            host,
            sample_ms = latency.as_millis() as u64,
            mean_ms = stats.mean_ms,
            stddev_ms = stats.var_ms2.sqrt(),
            "Recorded latency sample"
        );
    }

    pub fn timeout_for(&self, host: &str) -> Duration {
        let min = self.config.min_timeout();
        let max = self.config.max_timeout();

        let Some(entry) = self.hosts.get(host) else {
            return self.config.initial_timeout().clamp(min, max);
        };
        let (mean_ms, var_ms2) = {
            let stats = entry.lock();
            (stats.mean_ms, stats.var_ms2)
        };

        let timeout_ms = mean_ms + self.config.k * var_ms2.max(0.0).sqrt();
        if !timeout_ms.is_finite() {
            return max;
        }
        Duration::from_secs_f64((timeout_ms / 1000.0).max(0.0)).clamp(min, max)
    }

    pub fn stats(&self, host: &str) -> Option<LatencyStats> {
        let entry = self.hosts.get(host)?;
        let stats = entry.lock();
        Some(LatencyStats {
            mean: Duration::from_secs_f64(stats.mean_ms.max(0.0) / 1000.0),
            stddev: Duration::from_secs_f64(stats.var_ms2.max(0.0).sqrt() / 1000.0),
            samples: stats.samples,
            recent: stats.recent.iter().copied().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> AdaptiveTimeoutTracker {
        AdaptiveTimeoutTracker::new(AdaptiveTimeoutConfig {
            initial_timeout_ms: 10_000,
            min_timeout_ms: 500,
            max_timeout_ms: 30_000,
            k: 4.0,
            alpha: 0.125,
            sample_window: 4,
        })
    }

    #[test]
    fn unknown_host_uses_initial_timeout() {
        assert_eq!(tracker().timeout_for("a:80"), Duration::from_secs(10));
    }

    #[test]
    fn steady_latency_converges_to_min_bound() {
        let tracker = tracker();
        for _ in 0..200 {
            tracker.record("a:80", Duration::from_millis(100));
        }
        // mean 100ms, variance decays to ~0, so the lower clamp applies
        assert_eq!(tracker.timeout_for("a:80"), Duration::from_millis(500));
    }

    #[test]
    fn jittery_host_gets_more_headroom_than_steady_host() {
        let tracker = tracker();
        for i in 0..100 {
            tracker.record("steady:80", Duration::from_millis(2_000));
            let jitter = if i % 2 == 0 { 500 } else { 3_500 };
            tracker.record("jittery:80", Duration::from_millis(jitter));
        }
        assert!(tracker.timeout_for("jittery:80") > tracker.timeout_for("steady:80"));
    }

    #[test]
    fn timeout_is_clamped_to_max() {
        let tracker = tracker();
        tracker.record("slow:80", Duration::from_secs(120));
        assert_eq!(tracker.timeout_for("slow:80"), Duration::from_secs(30));
    }

    #[test]
    fn stats_keep_bounded_recent_window() {
        let tracker = tracker();
        for ms in [10, 20, 30, 40, 50, 60] {
            tracker.record("a:80", Duration::from_millis(ms));
        }
        let stats = tracker.stats("a:80").unwrap();
        assert_eq!(stats.samples, 6);
        assert_eq!(stats.recent.len(), 4);
        assert_eq!(stats.recent[0], Duration::from_millis(30));
    }
}
