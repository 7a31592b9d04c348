use std::time::Duration;

use super::{HostPoolStats, LatencyStats};
use crate::resilience::BreakerStatus;

/// What the engine currently believes about one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostHealthRecord {
    pub host: String,
    /// `None` until the first request to the host completes.
    pub latency: Option<LatencyStats>,
    /// Timeout the next request to this host will run under.
    pub timeout: Duration,
    pub breakers: Vec<BreakerStatus>,
    pub pool: HostPoolStats,
}

impl HostHealthRecord {
    /// True when any breaker for the host is refusing requests.
    pub fn is_degraded(&self) -> bool {
        self.breakers
            .iter()
            .any(|b| b.state != crate::resilience::CircuitState::Closed)
    }
}
