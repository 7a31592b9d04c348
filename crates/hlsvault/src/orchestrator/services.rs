use std::sync::Arc;

use super::events::EventBus;
use crate::config::EngineConfig;
use crate::crypto::Decryptor;
use crate::error::Result;
use crate::merger::Merger;
use crate::metrics::EngineMetrics;
use crate::net::{AdaptiveTimeoutTracker, ConnectionPool, HttpFetcher};
use crate::playlist::PlaylistParser;
use crate::recovery::RecoveryStore;
use crate::resilience::{CircuitBreakerRegistry, RetryCoordinator};
use crate::resources::ResourceTracker;
use crate::validator::SegmentValidator;

/// The shared collaborators every task runs against.
///
/// Built once per engine and handed to each runner; nothing in here is a
/// process-wide singleton, so tests can assemble their own.
#[derive(Clone)]
pub struct EngineServices {
    pub config: Arc<EngineConfig>,
    pub resources: Arc<ResourceTracker>,
    pub pool: Arc<ConnectionPool>,
    pub timeouts: Arc<AdaptiveTimeoutTracker>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryCoordinator>,
    pub fetcher: Arc<HttpFetcher>,
    pub parser: Arc<PlaylistParser>,
    pub decryptor: Arc<Decryptor>,
    pub validator: Arc<SegmentValidator>,
    pub recovery: Arc<RecoveryStore>,
    pub merger: Arc<Merger>,
    pub metrics: Arc<EngineMetrics>,
    pub events: EventBus,
}

impl EngineServices {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let resources = Arc::new(ResourceTracker::new(config.resources.clone()));
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            config.http.clone(),
            Arc::clone(&resources),
        ));
        let timeouts = Arc::new(AdaptiveTimeoutTracker::new(config.timeouts.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let retry = Arc::new(RetryCoordinator::new(
            config.retry.clone(),
            Arc::clone(&breakers),
        ));
        let fetcher = Arc::new(HttpFetcher::new(
            Arc::clone(&pool),
            Arc::clone(&breakers),
            Arc::clone(&timeouts),
            Arc::clone(&metrics),
        ));
        let parser = Arc::new(PlaylistParser::new(Arc::clone(&fetcher)));
        let decryptor =
            Arc::new(Decryptor::new(&config.decryption).with_metrics(Arc::clone(&metrics)));
        let validator = Arc::new(SegmentValidator::new(config.validation.clone()));
        let recovery = Arc::new(RecoveryStore::new(config.paths.state_dir.clone()));
        let events = EventBus::new(config.events.channel_capacity);

        Ok(Self {
            config: Arc::new(config),
            resources,
            pool,
            timeouts,
            breakers,
            retry,
            fetcher,
            parser,
            decryptor,
            validator,
            recovery,
            merger: Arc::new(Merger::new()),
            metrics,
            events,
        })
    }
}
