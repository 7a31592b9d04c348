// Retry Coordinator: the single place where retry, backoff and circuit-breaker
// decisions are made for playlist, key and segment requests.
//
// Implements exponential backoff with jitter, max delay cap, per-error-kind
// base policies and `Retry-After` handling.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use reqwest::StatusCode;
use tracing::debug;

use super::circuit_breaker::{BreakerKey, CircuitBreakerRegistry, RequestKind};
use crate::config::RetryConfig;
use crate::error::{DownloadError, NetworkFailure};

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl Backoff {
    /// Compute the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Everything the coordinator needs to know about one failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub error: &'a DownloadError,
    pub kind: RequestKind,
    pub host: Option<&'a str>,
    /// Attempts made so far, including the one that just failed.
    pub attempt: u32,
    /// Times this unit of work has already been parked behind an open circuit.
    pub circuit_deferrals: u32,
    pub task_id: &'a str,
    pub segment: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NonRetryable,
    AttemptsExhausted,
    /// The host stayed unavailable for every deferral.
    CircuitStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    /// The circuit is open: try again after the delay without spending an attempt.
    Defer(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Debug)]
pub struct RetryCoordinator {
    config: RetryConfig,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { config, breakers }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn decide(&self, ctx: &ErrorContext<'_>) -> RetryDecision {
        let decision = self.classify(ctx);
        debug!(
            task_id = ctx.task_id,
            segment = ctx.segment,
            host = ctx.host,
            kind = %ctx.kind,
            attempt = ctx.attempt,
            error = %ctx.error,
            ?decision,
            "Retry decision"
        );
        decision
    }

    fn classify(&self, ctx: &ErrorContext<'_>) -> RetryDecision {
        if !ctx.error.is_retryable() {
            return RetryDecision::GiveUp(GiveUpReason::NonRetryable);
        }

        // The breaker is consulted before the attempt budget: an open circuit
        // parks the work without counting a failed attempt.
        let open_for = match ctx.error {
            DownloadError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => ctx
                .host
                .and_then(|host| self.breakers.open_for(&BreakerKey::new(host, ctx.kind))),
        };
        if let Some(wait) = open_for {
            if ctx.circuit_deferrals >= self.config.max_circuit_deferrals {
                return RetryDecision::GiveUp(GiveUpReason::CircuitStuck);
            }
            return RetryDecision::Defer(wait.max(Duration::from_millis(10)));
        }

        if ctx.attempt >= self.config.max_attempts_per_segment {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }

        let retry_index = ctx.attempt.saturating_sub(1);
        match ctx.error {
            DownloadError::Network {
                kind: NetworkFailure::Dns | NetworkFailure::Connect,
                ..
            } => {
                if retry_index == 0 {
                    RetryDecision::RetryNow
                } else {
                    RetryDecision::RetryAfter(
                        self.backoff(self.config.connect_base_delay())
                            .delay_for_attempt(retry_index - 1),
                    )
                }
            }
            DownloadError::HttpStatus {
                status,
                retry_after: Some(hint),
                ..
            } if *status == StatusCode::TOO_MANY_REQUESTS
                || *status == StatusCode::SERVICE_UNAVAILABLE =>
            {
                let wait = (*hint).min(self.config.max_retry_after());
                if wait.is_zero() {
                    RetryDecision::RetryNow
                } else {
                    RetryDecision::RetryAfter(wait)
                }
            }
            _ => RetryDecision::RetryAfter(
                self.backoff(self.config.base_delay())
                    .delay_for_attempt(retry_index),
            ),
        }
    }

    fn backoff(&self, base_delay: Duration) -> Backoff {
        Backoff {
            base_delay,
            max_delay: self.config.max_delay(),
            jitter: self.config.use_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::EncryptionStage;

    fn coordinator() -> RetryCoordinator {
        let config = RetryConfig {
            max_attempts_per_segment: 5,
            base_delay_ms: 100,
            connect_base_delay_ms: 50,
            max_delay_ms: 1_000,
            use_jitter: false,
            max_retry_after_ms: 10_000,
            segment_failure_tolerance: 0,
            max_circuit_deferrals: 3,
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            min_requests: 2,
            ..Default::default()
        }));
        RetryCoordinator::new(config, breakers)
    }

    fn ctx(error: &DownloadError, attempt: u32) -> ErrorContext<'_> {
        ErrorContext {
            error,
            kind: RequestKind::Segment,
            host: Some("h:80"),
            attempt,
            circuit_deferrals: 0,
            task_id: "t",
            segment: Some(4),
        }
    }

    #[test]
    fn delay_respects_max_cap() {
        let backoff = Backoff {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        // attempt 10: 500ms * 2^10 = 512_000ms, should be capped to 5s
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let backoff = Backoff {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(1_000),
            jitter: true,
        };
        for attempt in 0..8 {
            let delay = backoff.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_millis(1_000));
            assert!(delay >= Duration::from_millis(400).min(backoff.max_delay));
        }
    }

    #[test]
    fn server_errors_back_off_exponentially() {
        let c = coordinator();
        let err = DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://h/4.ts");
        assert_eq!(
            c.decide(&ctx(&err, 1)),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            c.decide(&ctx(&err, 3)),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
    }

    #[test]
    fn connect_failures_retry_immediately_first() {
        let c = coordinator();
        let err = DownloadError::network("http://h/4.ts", NetworkFailure::Connect, "refused");
        assert_eq!(c.decide(&ctx(&err, 1)), RetryDecision::RetryNow);
        assert_eq!(
            c.decide(&ctx(&err, 2)),
            RetryDecision::RetryAfter(Duration::from_millis(50))
        );
    }

    #[test]
    fn client_errors_give_up_except_429() {
        let c = coordinator();
        let err = DownloadError::http_status(StatusCode::FORBIDDEN, "http://h/4.ts");
        assert_eq!(
            c.decide(&ctx(&err, 1)),
            RetryDecision::GiveUp(GiveUpReason::NonRetryable)
        );
        let err = DownloadError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://h/4.ts");
        assert!(matches!(c.decide(&ctx(&err, 1)), RetryDecision::RetryAfter(_)));
    }

    #[test]
    fn retry_after_hint_is_honoured_and_capped() {
        let c = coordinator();
        let err = DownloadError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: "http://h/4.ts".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            c.decide(&ctx(&err, 1)),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        let err = DownloadError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            url: "http://h/4.ts".into(),
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(
            c.decide(&ctx(&err, 1)),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn attempts_are_bounded() {
        let c = coordinator();
        let err = DownloadError::validation(Some(4), "empty");
        assert!(matches!(c.decide(&ctx(&err, 4)), RetryDecision::RetryAfter(_)));
        assert_eq!(
            c.decide(&ctx(&err, 5)),
            RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted)
        );
    }

    #[test]
    fn bad_key_gives_up_but_corrupt_padding_retries() {
        let c = coordinator();
        let bad_key = DownloadError::encryption(EncryptionStage::KeyInvalid, "15 bytes");
        assert_eq!(
            c.decide(&ctx(&bad_key, 1)),
            RetryDecision::GiveUp(GiveUpReason::NonRetryable)
        );
        let padding = DownloadError::Encryption {
            stage: EncryptionStage::Padding,
            reason: "bad padding".into(),
            retryable: true,
        };
        assert!(matches!(c.decide(&ctx(&padding, 1)), RetryDecision::RetryAfter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_without_spending_attempts() {
        let c = coordinator();
        let key = BreakerKey::new("h:80", RequestKind::Segment);
        for _ in 0..2 {
            c.breakers.admit(&key).unwrap().failure();
        }
        // an exhausted segment is parked rather than failed while the circuit is open
        let err = DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://h/4.ts");
        assert!(matches!(
            c.decide(&ctx(&err, 5)),
            RetryDecision::Defer(_)
        ));

        let rejected = DownloadError::CircuitOpen {
            host: "h:80".into(),
            retry_after: Duration::from_secs(3),
        };
        let mut context = ctx(&rejected, 1);
        assert_eq!(
            c.decide(&context),
            RetryDecision::Defer(Duration::from_secs(3))
        );
        context.circuit_deferrals = 3;
        assert_eq!(
            c.decide(&context),
            RetryDecision::GiveUp(GiveUpReason::CircuitStuck)
        );
    }

    #[test]
    fn cancellation_is_never_retried() {
        let c = coordinator();
        assert_eq!(
            c.decide(&ctx(&DownloadError::Cancelled, 1)),
            RetryDecision::GiveUp(GiveUpReason::NonRetryable)
        );
    }
}
