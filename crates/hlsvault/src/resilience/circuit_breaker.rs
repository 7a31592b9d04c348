use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{DownloadError, Result};

/// What a request fetches. Each host has one breaker per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Playlist,
    Key,
    Segment,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Playlist => "playlist",
            Self::Key => "key",
            Self::Segment => "segment",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub host: String,
    pub kind: RequestKind,
}

impl BreakerKey {
    pub fn new(host: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            host: host.into(),
            kind,
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.kind)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through; outcomes are counted in the sliding window.
    Closed,
    /// Requests are rejected without touching the network.
    Open,
    /// A bounded number of probes is admitted to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `(finished_at, failed)` for requests completed while closed.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    consecutive_failures: u32,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probes_admitted = 0;
        self.window.clear();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.probes_admitted = 0;
        self.consecutive_failures = 0;
        self.window.clear();
    }
}

/// Sliding-window failure-rate breaker for one host and request kind.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    rejected: AtomicU64,
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub kind: RequestKind,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_requests: usize,
    pub window_failures: usize,
    pub rejected: u64,
}

/// Admission to send one request. Settle it with [`BreakerPermit::success`]
/// or [`BreakerPermit::failure`]; dropping it unsettled gives a probe slot back.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_result(self.probe, false);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_result(self.probe, true);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.return_probe();
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: BreakerKey, config: CircuitBreakerConfig) -> Self {
        Self {
            key,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probes_admitted: 0,
                consecutive_failures: 0,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// Open -> half-open once the cooldown has elapsed.
    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && now.saturating_duration_since(opened_at) >= self.config.cooldown()
        {
            inner.state = CircuitState::HalfOpen;
            inner.probes_admitted = 0;
            debug!(breaker = %self.key, "Circuit breaker transitioned to half-open state");
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Remaining cooldown while open.
    pub fn open_for(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| {
                self.config
                    .cooldown()
                    .saturating_sub(now.saturating_duration_since(at))
            }),
            _ => None,
        }
    }

    pub fn try_admit(self: &Arc<Self>) -> Result<BreakerPermit> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if inner.probes_admitted < self.config.half_open_max_probes => {
                inner.probes_admitted += 1;
                debug!(
                    breaker = %self.key,
                    probe = inner.probes_admitted,
                    max = self.config.half_open_max_probes,
                    "Admitting half-open probe"
                );
                true
            }
            CircuitState::HalfOpen => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                // Probes are in flight; check back after a fraction of the cooldown.
                let retry_after = (self.config.cooldown() / 4).max(Duration::from_millis(50));
                return Err(self.rejection(retry_after));
            }
            CircuitState::Open => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                let retry_after = self.config.cooldown().saturating_sub(elapsed);
                return Err(self.rejection(retry_after));
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    fn rejection(&self, retry_after: Duration) -> DownloadError {
        DownloadError::CircuitOpen {
            host: self.key.host.clone(),
            retry_after,
        }
    }

    fn on_result(&self, probe: bool, failed: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        if failed {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        } else {
            inner.consecutive_failures = 0;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back((now, failed));
                inner.prune(now, self.config.window());
                let total = inner.window.len();
                let failures = inner.window.iter().filter(|(_, f)| *f).count();
                if failed
                    && total >= self.config.min_requests as usize
                    && failures as f64 / total as f64 >= self.config.failure_ratio_threshold
                {
                    inner.open(now);
                    warn!(
                        breaker = %self.key,
                        failures,
                        total,
                        cooldown_ms = self.config.cooldown_ms,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                if failed {
                    inner.open(now);
                    warn!(breaker = %self.key, "Circuit breaker reopened after failed probe");
                } else {
                    inner.close();
                    info!(breaker = %self.key, "Circuit breaker closed after successful probe");
                }
            }
            // Late results from requests admitted before the state changed.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn return_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probes_admitted > 0 {
            inner.probes_admitted -= 1;
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.prune(now, self.config.window());
        BreakerStatus {
            kind: self.key.kind,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            window_requests: inner.window.len(),
            window_failures: inner.window.iter().filter(|(_, f)| *f).count(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.inner.lock().close();
        debug!(breaker = %self.key, "Circuit breaker reset to closed state");
    }
}

/// Breakers for every host and request kind, shared by all tasks.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<BreakerKey, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return Arc::clone(breaker.value());
        }
        let breaker = self.breakers.entry(key.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(key.clone(), self.config.clone()))
        });
        Arc::clone(breaker.value())
    }

    /// Admit a request or reject it with [`DownloadError::CircuitOpen`].
    pub fn admit(&self, key: &BreakerKey) -> Result<BreakerPermit> {
        self.get(key).try_admit()
    }

    pub fn state(&self, key: &BreakerKey) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Remaining cooldown if the breaker for `key` is open.
    pub fn open_for(&self, key: &BreakerKey) -> Option<Duration> {
        self.breakers.get(key).and_then(|b| b.open_for())
    }

    pub fn host_status(&self, host: &str) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .filter(|e| e.key().host == host)
            .map(|e| Arc::clone(e.value()))
            .collect();
        breakers.iter().map(|b| b.status()).collect()
    }
}
