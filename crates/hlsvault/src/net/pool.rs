use std::sync::Arc;
use std::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, PoolConfig};
use crate::error::{DownloadError, Result};
use crate::proxy::build_proxy;
use crate::resources::{ResourceId, ResourceKind, ResourceTracker};

/// A reusable HTTP session bound to one host.
#[derive(Debug)]
struct Session {
    id: u64,
    client: Client,
    resource: ResourceId,
    unhealthy: AtomicBool,
}

#[derive(Debug)]
struct HostEntry {
    host: String,
    permits: Arc<Semaphore>,
    session: Mutex<Option<Arc<Session>>>,
    in_use: AtomicUsize,
    last_released: Mutex<Instant>,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPoolStats {
    pub in_use: usize,
    pub available: usize,
    pub has_session: bool,
    pub evictions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hosts: usize,
    pub sessions: usize,
    pub in_use: usize,
    pub global_available: usize,
}

/// Per-host session pool.
///
/// Each host gets one reusable `reqwest::Client`. Concurrency is bounded by a
/// per-host semaphore (`max_connections_per_host`) and a global one
/// (`pool_size`); a lease holds one permit of each, so two requests never
/// share a connection slot. Unhealthy releases evict the host's session and
/// the next acquire builds a fresh one.
pub struct ConnectionPool {
    config: PoolConfig,
    http: HttpConfig,
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<HostEntry>>,
    resources: Arc<ResourceTracker>,
    next_session_id: AtomicU64,
    retired: Mutex<Vec<ResourceId>>,
}

/// An exclusive lease on one connection slot for a host.
///
/// Dropping a lease without calling [`ConnectionPool::release`] returns it as healthy.
#[derive(Debug)]
pub struct PooledConnection {
    host: String,
    session: Arc<Session>,
    entry: Arc<HostEntry>,
    lease: ResourceId,
    resources: Arc<ResourceTracker>,
    released: bool,
    _host_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &Client {
        &self.session.client
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session_id(&self) -> u64 {
        self.session.id
    }

    fn finish(&mut self, healthy: bool) {
        if self.released {
            return;
        }
        self.released = true;

        if !healthy {
            self.session.unhealthy.store(true, Ordering::Release);
            let mut slot = self.entry.session.lock();
            if slot.as_ref().is_some_and(|s| s.id == self.session.id) {
                slot.take();
                self.entry.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(host = %self.host, session = self.session.id, "Evicted unhealthy session");
            }
        }

        if let Err(e) = self.resources.cleanup(self.lease) {
            debug!(host = %self.host, error = %e, "Failed to clean connection lease");
        }
        if healthy {
            if let Err(e) = self.resources.touch(self.session.resource) {
                warn!(host = %self.host, error = %e, "Failed to refresh session handle");
            }
        }
        self.entry.in_use.fetch_sub(1, Ordering::AcqRel);
        *self.entry.last_released.lock() = Instant::now();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, http: HttpConfig, resources: Arc<ResourceTracker>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.pool_size)),
            config,
            http,
            hosts: DashMap::new(),
            resources,
            next_session_id: AtomicU64::new(1),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn entry(&self, host: &str) -> Arc<HostEntry> {
        if let Some(entry) = self.hosts.get(host) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostEntry {
                    host: host.to_string(),
                    permits: Arc::new(Semaphore::new(self.config.max_connections_per_host)),
                    session: Mutex::new(None),
                    in_use: AtomicUsize::new(0),
                    last_released: Mutex::new(Instant::now()),
                    evictions: AtomicU64::new(0),
                })
            });
        Arc::clone(entry.value())
    }

    /// Lease a connection slot for `host`, waiting while the host or the
    /// whole pool is saturated.
    pub async fn acquire(&self, host: &str) -> Result<PooledConnection> {
        let entry = self.entry(host);
        let permits = async {
            let host_permit = Arc::clone(&entry.permits)
                .acquire_owned()
                .await
                .map_err(|_| DownloadError::resource("connection pool is closed"))?;
            let global_permit = Arc::clone(&self.global)
                .acquire_owned()
                .await
                .map_err(|_| DownloadError::resource("connection pool is closed"))?;
            Ok::<_, DownloadError>((host_permit, global_permit))
        };

        let (host_permit, global_permit) = match self.config.saturation_warn() {
            Some(every) if !every.is_zero() => {
                tokio::pin!(permits);
                let mut waited = Duration::ZERO;
                loop {
                    tokio::select! {
                        acquired = &mut permits => break acquired?,
                        _ = tokio::time::sleep(every) => {
                            waited += every;
                            warn!(
                                host,
                                waited_ms = waited.as_millis() as u64,
                                in_use = entry.in_use.load(Ordering::Acquire),
                                "Host saturated, still waiting for a connection slot"
                            );
                        }
                    }
                }
            }
            _ => permits.await?,
        };

        let session = self.session_for(&entry)?;
        let lease = self
            .resources
            .register(ResourceKind::Connection, format!("lease {host}"));
        if let Err(e) = self
            .resources
            .add_dependent(session.resource, lease)
            .and_then(|()| self.resources.touch(lease))
            .and_then(|()| self.resources.touch(session.resource))
        {
            warn!(host, error = %e, "Failed to track connection lease");
        }
        entry.in_use.fetch_add(1, Ordering::AcqRel);

        Ok(PooledConnection {
            host: host.to_string(),
            session,
            entry,
            lease,
            resources: Arc::clone(&self.resources),
            released: false,
            _host_permit: host_permit,
            _global_permit: global_permit,
        })
    }

    /// Return a lease. Unhealthy leases evict the host's current session.
    pub fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let previous = conn.session.resource;
        let evicting = !healthy && {
            let slot = conn.entry.session.lock();
            slot.as_ref().is_some_and(|s| s.id == conn.session.id)
        };
        conn.finish(healthy);
        if evicting {
            self.retire(previous);
        }
    }

    fn session_for(&self, entry: &HostEntry) -> Result<Arc<Session>> {
        let mut slot = entry.session.lock();
        if let Some(session) = slot.as_ref() {
            if !session.unhealthy.load(Ordering::Acquire) {
                return Ok(Arc::clone(session));
            }
        }

        let client = self.build_client()?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let resource = self
            .resources
            .register(ResourceKind::Session, format!("session {} #{id}", entry.host));
        let session = Arc::new(Session {
            id,
            client,
            resource,
            unhealthy: AtomicBool::new(false),
        });
        if let Some(old) = slot.replace(Arc::clone(&session)) {
            self.retire(old.resource);
        }
        debug!(host = %entry.host, session = id, "Created HTTP session");
        Ok(session)
    }

    fn build_client(&self) -> Result<Client> {
        let headers = self.http.header_map()?;
        let mut builder = Client::builder()
            .pool_max_idle_per_host(self.config.max_connections_per_host)
            .pool_idle_timeout(self.config.idle_timeout())
            .user_agent(&self.http.user_agent)
            .default_headers(headers)
            .danger_accept_invalid_certs(self.http.danger_accept_invalid_certs)
            .redirect(if self.http.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });

        if !self.http.connect_timeout().is_zero() {
            builder = builder.connect_timeout(self.http.connect_timeout());
        }

        if let Some(proxy_config) = &self.http.proxy {
            builder = builder.proxy(build_proxy(proxy_config)?);
        } else if !self.http.use_system_proxy {
            builder = builder.no_proxy();
        }

        builder
            .build()
            .map_err(|e| DownloadError::resource(format!("failed to build HTTP client: {e}")))
    }

    fn retire(&self, resource: ResourceId) {
        if self.resources.cleanup(resource).is_err() {
            // Leases still reference it; the sweep finishes the job.
            if let Err(e) = self.resources.request_cleanup(resource) {
                warn!(resource = %resource, error = %e, "Failed to flag retired session");
            }
            self.retired.lock().push(resource);
        }
    }

    /// Evict sessions idle past the idle timeout and finish retiring evicted ones.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut evicted = 0;

        let entries: Vec<Arc<HostEntry>> =
            self.hosts.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            if entry.in_use.load(Ordering::Acquire) > 0 {
                continue;
            }
            let idle_for = now.saturating_duration_since(*entry.last_released.lock());
            let stale = {
                let mut slot = entry.session.lock();
                let expired = slot.as_ref().is_some_and(|s| {
                    idle_for >= idle_timeout || s.unhealthy.load(Ordering::Acquire)
                });
                if expired { slot.take() } else { None }
            };
            if let Some(session) = stale {
                entry.evictions.fetch_add(1, Ordering::Relaxed);
                self.retire(session.resource);
                evicted += 1;
                debug!(host = %entry.host, session = session.id, "Evicted idle session");
            }
        }

        let pending: Vec<ResourceId> = std::mem::take(&mut *self.retired.lock());
        for resource in pending {
            if self.resources.get(resource).is_some() && self.resources.cleanup(resource).is_err() {
                self.retired.lock().push(resource);
            }
        }
        evicted
    }

    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self
            .config
            .sweep_interval()
            .max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = pool.sweep();
                        if evicted > 0 {
                            debug!(evicted, "Connection pool sweep");
                        }
                    }
                }
            }
            info!("Connection pool sweeper stopped");
        })
    }

    pub fn host_stats(&self, host: &str) -> HostPoolStats {
        let Some(entry) = self.hosts.get(host).map(|e| Arc::clone(e.value())) else {
            return HostPoolStats {
                available: self.config.max_connections_per_host,
                ..Default::default()
            };
        };
        HostPoolStats {
            in_use: entry.in_use.load(Ordering::Acquire),
            available: entry.permits.available_permits(),
            has_session: entry.session.lock().is_some(),
            evictions: entry.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let entries: Vec<Arc<HostEntry>> =
            self.hosts.iter().map(|e| Arc::clone(e.value())).collect();
        PoolStats {
            hosts: entries.len(),
            sessions: entries.iter().filter(|e| e.session.lock().is_some()).count(),
            in_use: entries
                .iter()
                .map(|e| e.in_use.load(Ordering::Acquire))
                .sum(),
            global_available: self.global.available_permits(),
        }
    }

    /// Stop handing out leases. Waiters fail with a resource error.
    pub fn close(&self) {
        self.global.close();
        for entry in self.hosts.iter() {
            entry.permits.close();
        }
        warn!("Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use std::time::Duration;

    fn pool(per_host: usize, total: usize) -> (ConnectionPool, Arc<ResourceTracker>) {
        let resources = Arc::new(ResourceTracker::new(ResourceConfig::default()));
        let config = PoolConfig {
            max_connections_per_host: per_host,
            pool_size: total,
            idle_timeout_ms: 1_000,
            saturation_warn_ms: Some(100),
            sweep_interval_ms: 1_000,
        };
        let http = HttpConfig {
            use_system_proxy: false,
            ..Default::default()
        };
        (
            ConnectionPool::new(config, http, Arc::clone(&resources)),
            resources,
        )
    }

    #[tokio::test]
    async fn reuses_one_session_per_host() {
        let (pool, _) = pool(2, 4);
        let a = pool.acquire("a:80").await.unwrap();
        let b = pool.acquire("a:80").await.unwrap();
        assert_eq!(a.session_id(), b.session_id());
        let c = pool.acquire("b:80").await.unwrap();
        assert_ne!(a.session_id(), c.session_id());
        assert_eq!(pool.stats().in_use, 3);
        pool.release(a, true);
        pool.release(b, true);
        drop(c);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_host_queues_instead_of_failing() {
        let (pool, _) = pool(1, 4);
        let held = pool.acquire("a:80").await.unwrap();
        // still queued well past several warning intervals
        let queued = tokio::time::timeout(Duration::from_secs(5), pool.acquire("a:80")).await;
        assert!(queued.is_err());
        // other hosts are unaffected
        assert!(pool.acquire("b:80").await.is_ok());

        pool.release(held, true);
        assert!(pool.acquire("a:80").await.is_ok());
    }

    #[tokio::test]
    async fn global_limit_bounds_all_hosts() {
        let (pool, _) = pool(4, 2);
        let _a = pool.acquire("a:80").await.unwrap();
        let _b = pool.acquire("b:80").await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(300), pool.acquire("c:80")).await;
        assert!(third.is_err());
    }

    #[tokio::test]
    async fn waiter_is_served_when_slot_is_released() {
        let (pool, _) = pool(1, 1);
        let pool = Arc::new(pool);
        let held = pool.acquire("a:80").await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("a:80").await.map(|c| c.session_id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = held.session_id();
        pool.release(held, true);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn unhealthy_release_evicts_session() {
        let (pool, resources) = pool(2, 2);
        let conn = pool.acquire("a:80").await.unwrap();
        let first = conn.session_id();
        pool.release(conn, false);
        assert_eq!(pool.host_stats("a:80").evictions, 1);
        assert!(!pool.host_stats("a:80").has_session);

        let conn = pool.acquire("a:80").await.unwrap();
        assert_ne!(conn.session_id(), first);
        drop(conn);
        // the retired session was cleaned immediately since it had no leases
        assert_eq!(resources.stats().cleanup_pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions() {
        let (pool, _) = pool(2, 2);
        drop(pool.acquire("a:80").await.unwrap());
        assert_eq!(pool.sweep(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.sweep(), 1);
        assert!(!pool.host_stats("a:80").has_session);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let (pool, _) = pool(1, 1);
        pool.close();
        assert!(matches!(
            pool.acquire("a:80").await,
            Err(DownloadError::Resource { .. })
        ));
    }
}
