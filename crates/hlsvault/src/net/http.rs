use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RANGE, RETRY_AFTER};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use super::{AdaptiveTimeoutTracker, ConnectionPool, PooledConnection, host_key};
use crate::error::{DownloadError, NetworkFailure, Result, parse_retry_after};
use crate::metrics::EngineMetrics;
use crate::model::ByteRange;
use crate::resilience::{BreakerKey, CircuitBreakerRegistry, RequestKind};

/// One guarded GET.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a Url,
    pub kind: RequestKind,
    /// Per-task headers layered over the session defaults.
    pub headers: &'a HeaderMap,
    pub range: Option<ByteRange>,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a Url, kind: RequestKind, headers: &'a HeaderMap) -> Self {
        Self {
            url,
            kind,
            headers,
            range: None,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Bytes,
    /// Bytes received on the wire before any range slicing.
    pub wire_len: u64,
    pub latency: Duration,
}

/// The single request path for playlists, keys and segments.
///
/// A fetch is admitted by the host's breaker, leases a pooled session, runs
/// under the host's adaptive timeout and reports its outcome back to all
/// three. It never retries; retry policy lives in the coordinator.
pub struct HttpFetcher {
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    timeouts: Arc<AdaptiveTimeoutTracker>,
    metrics: Arc<EngineMetrics>,
}

impl HttpFetcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        timeouts: Arc<AdaptiveTimeoutTracker>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            pool,
            breakers,
            timeouts,
            metrics,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub async fn fetch(
        &self,
        request: FetchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<FetchedBody> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let host = host_key(request.url)?;
        let permit = match self
            .breakers
            .admit(&BreakerKey::new(host.clone(), request.kind))
        {
            Ok(permit) => permit,
            Err(e) => {
                self.metrics.record_short_circuit();
                return Err(e);
            }
        };

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            conn = self.pool.acquire(&host) => conn?,
        };

        let timeout = self.timeouts.timeout_for(&host);
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = tokio::time::timeout(timeout, execute(&conn, &request)) => match result {
                Ok(inner) => inner,
                Err(_) => Err(DownloadError::Timeout {
                    url: request.url.to_string(),
                    after: timeout,
                }),
            },
        };
        let latency = started.elapsed();

        match &outcome {
            Ok(body) => {
                self.timeouts.record(&host, latency);
                self.metrics.record_request(body.wire_len, latency);
            }
            Err(DownloadError::HttpStatus { .. }) => {
                self.timeouts.record(&host, latency);
                self.metrics.record_request_error();
            }
            Err(DownloadError::Timeout { after, .. }) => {
                self.timeouts.record(&host, *after);
                self.metrics.record_timeout();
                self.metrics.record_request_error();
            }
            Err(DownloadError::Cancelled) => {}
            Err(_) => self.metrics.record_request_error(),
        }

        match &outcome {
            // an abandoned request says nothing about the host
            Err(DownloadError::Cancelled) => drop(permit),
            Err(e) if e.is_host_failure() => permit.failure(),
            _ => permit.success(),
        }

        let healthy = !matches!(
            outcome,
            Err(DownloadError::Network { .. } | DownloadError::Timeout { .. })
        );
        self.pool.release(conn, healthy);

        match &outcome {
            Ok(body) => trace!(
                url = %request.url,
                kind = %request.kind,
                bytes = body.bytes.len(),
                latency_ms = latency.as_millis() as u64,
                "Fetched"
            ),
            Err(e) => debug!(url = %request.url, kind = %request.kind, error = %e, "Fetch failed"),
        }
        outcome.map(|body| FetchedBody { latency, ..body })
    }
}

async fn execute(conn: &PooledConnection, request: &FetchRequest<'_>) -> Result<FetchedBody> {
    let url = request.url.as_str();
    let mut builder = conn
        .client()
        .get(request.url.clone())
        .headers(request.headers.clone());
    if let Some(range) = request.range {
        builder = builder.header(RANGE, range.header_value());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| DownloadError::from_reqwest(url, &e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(DownloadError::HttpStatus {
            status,
            url: url.to_string(),
            retry_after,
        });
    }

    let capacity = response.content_length().unwrap_or(0) as usize;
    let mut buffer = BytesMut::with_capacity(capacity);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            DownloadError::network(url, NetworkFailure::Body, e.to_string())
        })?;
        buffer.extend_from_slice(&chunk);
    }
    let wire_len = buffer.len() as u64;
    let mut bytes = buffer.freeze();

    // Servers that ignore Range answer 200 with the whole resource.
    if let Some(range) = request.range {
        if status != StatusCode::PARTIAL_CONTENT {
            let start = range.offset as usize;
            let end = start.saturating_add(range.length as usize);
            if end > bytes.len() {
                return Err(DownloadError::network(
                    url,
                    NetworkFailure::Body,
                    format!(
                        "range {}-{} beyond body of {} bytes",
                        start,
                        end,
                        bytes.len()
                    ),
                ));
            }
            bytes = bytes.slice(start..end);
        }
    }

    Ok(FetchedBody {
        bytes,
        wire_len,
        latency: Duration::ZERO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdaptiveTimeoutConfig, CircuitBreakerConfig, HttpConfig, PoolConfig, ResourceConfig,
    };
    use crate::resilience::CircuitState;
    use crate::resources::ResourceTracker;

    fn fetcher(breaker: CircuitBreakerConfig) -> HttpFetcher {
        let resources = Arc::new(ResourceTracker::new(ResourceConfig::default()));
        let http = HttpConfig {
            use_system_proxy: false,
            ..Default::default()
        };
        HttpFetcher::new(
            Arc::new(ConnectionPool::new(PoolConfig::default(), http, resources)),
            Arc::new(CircuitBreakerRegistry::new(breaker)),
            Arc::new(AdaptiveTimeoutTracker::new(AdaptiveTimeoutConfig::default())),
            Arc::new(EngineMetrics::new()),
        )
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_network() {
        let fetcher = fetcher(CircuitBreakerConfig::default());
        let url = Url::parse("http://127.0.0.1:9/seg.ts").unwrap();
        let headers = HeaderMap::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = fetcher
            .fetch(FetchRequest::new(&url, RequestKind::Segment, &headers), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(fetcher.metrics().snapshot().requests_total, 0);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_a_request() {
        let fetcher = fetcher(CircuitBreakerConfig {
            min_requests: 1,
            failure_ratio_threshold: 0.5,
            cooldown_ms: 60_000,
            ..Default::default()
        });
        let url = Url::parse("http://127.0.0.1:9/seg.ts").unwrap();
        let key = BreakerKey::new("127.0.0.1:9", RequestKind::Segment);
        fetcher.breakers().admit(&key).unwrap().failure();
        assert_eq!(fetcher.breakers().state(&key), CircuitState::Open);

        let headers = HeaderMap::new();
        let err = fetcher
            .fetch(
                FetchRequest::new(&url, RequestKind::Segment, &headers),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::CircuitOpen { .. }));
        let snap = fetcher.metrics().snapshot();
        assert_eq!(snap.requests_short_circuited, 1);
        assert_eq!(snap.request_errors, 0);
    }
}
