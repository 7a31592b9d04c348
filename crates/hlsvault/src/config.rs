use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Top-level engine configuration. Loading it is the caller's business; the
/// engine only consumes the values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub timeouts: AdaptiveTimeoutConfig,
    pub pool: PoolConfig,
    pub http: HttpConfig,
    pub paths: PathsConfig,
    pub resources: ResourceConfig,
    pub validation: ValidationConfig,
    pub decryption: DecryptionConfig,
    pub events: EventConfig,
    /// Wall-clock budget for one run of a task. `None` disables it.
    pub task_budget_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Tasks running at the same time.
    pub max_concurrent_tasks: usize,
    /// Segment downloads in flight within one task.
    pub max_workers_per_task: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_workers_per_task: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per segment, including the first one.
    pub max_attempts_per_segment: u32,
    /// Base backoff for server-side failures (5xx, corrupt data).
    pub base_delay_ms: u64,
    /// Base backoff for DNS/connect failures, which are retried aggressively.
    pub connect_base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub use_jitter: bool,
    /// Upper bound applied to server `Retry-After` hints.
    pub max_retry_after_ms: u64,
    /// Permanently failed segments a task may accumulate before it fails.
    pub segment_failure_tolerance: u64,
    /// How many times one segment may be parked behind an open circuit.
    pub max_circuit_deferrals: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_segment: 5,
            base_delay_ms: 500,
            connect_base_delay_ms: 200,
            max_delay_ms: 30_000,
            use_jitter: true,
            max_retry_after_ms: 60_000,
            segment_failure_tolerance: 0,
            max_circuit_deferrals: 30,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn connect_base_delay(&self) -> Duration {
        Duration::from_millis(self.connect_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Length of the sliding window over which failures are counted.
    pub window_ms: u64,
    /// Requests that must be observed in the window before the ratio applies.
    pub min_requests: u32,
    /// Failure ratio in `(0, 1]` that opens the circuit.
    pub failure_ratio_threshold: f64,
    pub cooldown_ms: u64,
    /// Probe requests admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 30_000,
            min_requests: 5,
            failure_ratio_threshold: 0.5,
            cooldown_ms: 15_000,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTimeoutConfig {
    /// Timeout used for a host before any latency has been observed.
    pub initial_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Standard deviations added to the mean.
    pub k: f64,
    /// EWMA smoothing factor in `(0, 1]`.
    pub alpha: f64,
    /// Raw samples kept per host for inspection.
    pub sample_window: usize,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 20_000,
            min_timeout_ms: 3_000,
            max_timeout_ms: 60_000,
            k: 4.0,
            alpha: 0.125,
            sample_window: 32,
        }
    }
}

impl AdaptiveTimeoutConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections_per_host: usize,
    /// Connections leased across all hosts.
    pub pool_size: usize,
    /// Sessions unused for this long are evicted by the health sweep.
    pub idle_timeout_ms: u64,
    /// `acquire` keeps queueing on a saturated host; past this it logs a
    /// warning every interval.
    pub saturation_warn_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            pool_size: 32,
            idle_timeout_ms: 90_000,
            saturation_warn_ms: Some(30_000),
            sweep_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn saturation_warn(&self) -> Option<Duration> {
        self.saturation_warn_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub follow_redirects: bool,
    /// Headers sent with every request, before per-task headers.
    pub headers: Vec<(String, String)>,
    pub proxy: Option<ProxyConfig>,
    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,
    pub danger_accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout_ms: 10_000,
            follow_redirects: true,
            headers: Vec::new(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default headers merged with the configured ones; configured headers win.
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = default_headers();
        for (name, value) in parse_headers(&self.headers)?.iter() {
            headers.insert(name.clone(), value.clone());
        }
        Ok(headers)
    }
}

pub fn default_headers() -> HeaderMap {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    default_headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    default_headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    default_headers
}

/// Convert `(name, value)` pairs into a header map, rejecting malformed entries.
pub fn parse_headers(pairs: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
            DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
        })?;
        let header_value = HeaderValue::from_str(value.trim()).map_err(|e| {
            DownloadError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for relative task output paths.
    pub output_dir: PathBuf,
    /// Per-task segment artifacts live under `temp_dir/<task_id>/`.
    pub temp_dir: PathBuf,
    /// Recovery sidecars live here, one file per task.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            temp_dir: PathBuf::from(".hlsvault").join("segments"),
            state_dir: PathBuf::from(".hlsvault").join("state"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub sweep_interval_ms: u64,
    /// Idle handles older than this are queued for cleanup.
    pub idle_ttl_ms: u64,
    /// Active handles untouched for this long are reported as leaked.
    pub leak_threshold_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            idle_ttl_ms: 60_000,
            leak_threshold_ms: 600_000,
        }
    }
}

impl ResourceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn leak_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_segment_bytes: usize,
    /// Check the container signature when the segment URL names a known format.
    pub enforce_container_signature: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_segment_bytes: 1,
            enforce_container_signature: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptionConfig {
    /// Run AES work on the blocking thread pool.
    pub offload_to_blocking: bool,
    /// Segments smaller than this are decrypted inline even when offloading.
    pub offload_min_bytes: usize,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            offload_to_blocking: false,
            offload_min_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
    /// Minimum spacing between progress events of one task.
    pub progress_interval_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            progress_interval_ms: 0,
        }
    }
}

impl EngineConfig {
    pub fn task_budget(&self) -> Option<Duration> {
        self.task_budget_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency.max_concurrent_tasks == 0 {
            return Err(DownloadError::configuration(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.concurrency.max_workers_per_task == 0 {
            return Err(DownloadError::configuration(
                "max_workers_per_task must be at least 1",
            ));
        }
        if self.retry.max_attempts_per_segment == 0 {
            return Err(DownloadError::configuration(
                "max_attempts_per_segment must be at least 1",
            ));
        }
        if self.pool.pool_size == 0 || self.pool.max_connections_per_host == 0 {
            return Err(DownloadError::configuration(
                "pool_size and max_connections_per_host must be at least 1",
            ));
        }
        if self.timeouts.min_timeout_ms > self.timeouts.max_timeout_ms {
            return Err(DownloadError::configuration(format!(
                "min_timeout_ms ({}) exceeds max_timeout_ms ({})",
                self.timeouts.min_timeout_ms, self.timeouts.max_timeout_ms
            )));
        }
        if !(self.timeouts.alpha > 0.0 && self.timeouts.alpha <= 1.0) {
            return Err(DownloadError::configuration("alpha must be in (0, 1]"));
        }
        if self.timeouts.k < 0.0 {
            return Err(DownloadError::configuration("k must not be negative"));
        }
        let ratio = self.circuit_breaker.failure_ratio_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(DownloadError::configuration(
                "failure_ratio_threshold must be in (0, 1]",
            ));
        }
        if self.circuit_breaker.half_open_max_probes == 0 {
            return Err(DownloadError::configuration(
                "half_open_max_probes must be at least 1",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(DownloadError::configuration(
                "event channel capacity must be at least 1",
            ));
        }
        self.http.header_map()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_timeout_bounds() {
        let mut config = EngineConfig::default();
        config.timeouts.min_timeout_ms = 10_000;
        config.timeouts.max_timeout_ms = 1_000;
        assert!(matches!(
            config.validate(),
            Err(DownloadError::Configuration { .. })
        ));
    }

    #[test]
    fn configured_headers_override_defaults() {
        let config = HttpConfig {
            headers: vec![("Accept".into(), "video/mp2t".into())],
            ..Default::default()
        };
        let headers = config.header_map().unwrap();
        assert_eq!(headers.get("accept").unwrap(), "video/mp2t");
        assert!(headers.contains_key("accept-language"));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let err = parse_headers(&[("Bad Header".into(), "x".into())]).unwrap_err();
        assert!(matches!(err, DownloadError::Configuration { .. }));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"concurrency":{"max_workers_per_task":8}}"#).unwrap();
        assert_eq!(config.concurrency.max_workers_per_task, 8);
        assert_eq!(config.concurrency.max_concurrent_tasks, 3);
        assert_eq!(config.retry.segment_failure_tolerance, 0);
    }
}
