//! Resource lifecycle tracking.
//!
//! Every pooled session, connection lease, in-flight buffer and temporary
//! artifact is registered here when created and removed when cleaned. A single
//! background sweep ages idle handles into cleanup and flags handles that have
//! stayed active without use for too long as leaked.
//!
//! The registry is a sharded map of individually locked entries. Readers clone
//! the entry pointers, release the shard, then lock entries one at a time, so
//! status queries never hold a registry-wide lock.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResourceConfig;
use crate::error::{DownloadError, Result};

pub type ResourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A reusable per-host HTTP session.
    Session,
    /// One lease of a pooled connection slot.
    Connection,
    /// An in-memory segment buffer.
    Buffer,
    TempFile,
    TempDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Created,
    Active,
    Idle,
    CleanupPending,
    Cleaned,
    Leaked,
}

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub label: String,
    pub state: ResourceState,
    pub age: Duration,
    pub idle_for: Duration,
    pub parent: Option<ResourceId>,
    pub dependents: Vec<ResourceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub created: usize,
    pub active: usize,
    pub idle: usize,
    pub cleanup_pending: usize,
    pub leaked: usize,
    pub cleaned_total: u64,
    pub leaked_total: u64,
}

impl ResourceStats {
    pub fn live(&self) -> usize {
        self.created + self.active + self.idle + self.cleanup_pending + self.leaked
    }
}

/// What a single sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queued_for_cleanup: usize,
    pub cleaned: usize,
    pub newly_leaked: usize,
}

#[derive(Debug)]
struct HandleEntry {
    kind: ResourceKind,
    label: String,
    state: ResourceState,
    created_at: Instant,
    last_used_at: Instant,
    path: Option<PathBuf>,
    parent: Option<ResourceId>,
    dependents: HashSet<ResourceId>,
}

impl HandleEntry {
    fn snapshot(&self, id: ResourceId, now: Instant) -> ResourceSnapshot {
        ResourceSnapshot {
            id,
            kind: self.kind,
            label: self.label.clone(),
            state: self.state,
            age: now.saturating_duration_since(self.created_at),
            idle_for: now.saturating_duration_since(self.last_used_at),
            parent: self.parent,
            dependents: self.dependents.iter().copied().collect(),
        }
    }
}

#[derive(Debug)]
pub struct ResourceTracker {
    config: ResourceConfig,
    handles: DashMap<ResourceId, Arc<Mutex<HandleEntry>>>,
    next_id: AtomicU64,
    cleaned_total: AtomicU64,
    leaked_total: AtomicU64,
}

impl ResourceTracker {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            cleaned_total: AtomicU64::new(0),
            leaked_total: AtomicU64::new(0),
        }
    }

    pub fn register(&self, kind: ResourceKind, label: impl Into<String>) -> ResourceId {
        self.insert(kind, label.into(), None)
    }

    /// Register a filesystem artifact; cleaning it deletes the path.
    pub fn register_path(
        &self,
        kind: ResourceKind,
        label: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> ResourceId {
        self.insert(kind, label.into(), Some(path.into()))
    }

    fn insert(&self, kind: ResourceKind, label: String, path: Option<PathBuf>) -> ResourceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        self.handles.insert(
            id,
            Arc::new(Mutex::new(HandleEntry {
                kind,
                label,
                state: ResourceState::Created,
                created_at: now,
                last_used_at: now,
                path,
                parent: None,
                dependents: HashSet::new(),
            })),
        );
        id
    }

    fn entry(&self, id: ResourceId) -> Result<Arc<Mutex<HandleEntry>>> {
        self.handles
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DownloadError::resource(format!("unknown resource handle {id}")))
    }

    /// Mark a handle in use and refresh its last-used time.
    pub fn touch(&self, id: ResourceId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        if entry.state == ResourceState::Leaked {
            debug!(id, label = %entry.label, "Leaked resource is in use again");
        }
        entry.state = ResourceState::Active;
        entry.last_used_at = Instant::now();
        Ok(())
    }

    pub fn mark_idle(&self, id: ResourceId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.state = ResourceState::Idle;
        entry.last_used_at = Instant::now();
        Ok(())
    }

    /// Queue a handle for cleanup by the next sweep.
    pub fn request_cleanup(&self, id: ResourceId) -> Result<()> {
        let entry = self.entry(id)?;
        entry.lock().state = ResourceState::CleanupPending;
        Ok(())
    }

    /// Record that `child` must be cleaned before `parent`.
    pub fn add_dependent(&self, parent: ResourceId, child: ResourceId) -> Result<()> {
        if parent == child {
            return Err(DownloadError::resource(format!(
                "resource {parent} cannot depend on itself"
            )));
        }
        let parent_entry = self.entry(parent)?;
        let child_entry = self.entry(child)?;
        parent_entry.lock().dependents.insert(child);
        child_entry.lock().parent = Some(parent);
        Ok(())
    }

    /// Clean a handle: run its cleanup action and drop it from the registry.
    /// Fails while the handle still has dependents.
    pub fn cleanup(&self, id: ResourceId) -> Result<()> {
        let entry = self.entry(id)?;
        let (parent, path, kind) = {
            let mut entry = entry.lock();
            if !entry.dependents.is_empty() {
                entry.state = ResourceState::CleanupPending;
                return Err(DownloadError::resource(format!(
                    "resource {id} ({}) still has {} dependents",
                    entry.label,
                    entry.dependents.len()
                )));
            }
            if let Some(path) = &entry.path {
                remove_path(entry.kind, path)?;
            }
            entry.state = ResourceState::Cleaned;
            (entry.parent, entry.path.clone(), entry.kind)
        };

        self.handles.remove(&id);
        self.cleaned_total.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = parent {
            self.detach_from_parent(parent, id);
        }
        debug!(id, ?kind, ?path, "Resource cleaned");
        Ok(())
    }

    /// Clean a handle after cleaning everything that depends on it.
    pub fn cleanup_tree(&self, id: ResourceId) -> Result<()> {
        for child in self.dependents_of(id)? {
            self.cleanup_tree(child)?;
        }
        self.cleanup(id)
    }

    /// Stop tracking a handle and its dependents without running cleanup
    /// actions. Used when artifacts outlive the run that created them.
    pub fn release_tree(&self, id: ResourceId) -> Result<()> {
        for child in self.dependents_of(id)? {
            self.release_tree(child)?;
        }
        if let Some((_, entry)) = self.handles.remove(&id) {
            let parent = entry.lock().parent;
            if let Some(parent) = parent {
                self.detach_from_parent(parent, id);
            }
        }
        Ok(())
    }

    fn dependents_of(&self, id: ResourceId) -> Result<Vec<ResourceId>> {
        let entry = self.entry(id)?;
        let children = entry.lock().dependents.iter().copied().collect();
        Ok(children)
    }

    fn detach_from_parent(&self, parent: ResourceId, child: ResourceId) {
        if let Some(parent_entry) = self.handles.get(&parent).map(|e| Arc::clone(e.value())) {
            parent_entry.lock().dependents.remove(&child);
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<ResourceSnapshot> {
        let entry = self.handles.get(&id).map(|e| Arc::clone(e.value()))?;
        let snapshot = entry.lock().snapshot(id, Instant::now());
        Some(snapshot)
    }

    fn entries(&self) -> Vec<(ResourceId, Arc<Mutex<HandleEntry>>)> {
        self.handles
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries()
            .into_iter()
            .map(|(id, entry)| entry.lock().snapshot(id, now))
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn stats(&self) -> ResourceStats {
        let mut stats = ResourceStats {
            cleaned_total: self.cleaned_total.load(Ordering::Relaxed),
            leaked_total: self.leaked_total.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, entry) in self.entries() {
            match entry.lock().state {
                ResourceState::Created => stats.created += 1,
                ResourceState::Active => stats.active += 1,
                ResourceState::Idle => stats.idle += 1,
                ResourceState::CleanupPending => stats.cleanup_pending += 1,
                ResourceState::Leaked => stats.leaked += 1,
                ResourceState::Cleaned => {}
            }
        }
        stats
    }

    /// Age every handle once.
    ///
    /// Idle handles past the idle TTL are queued for cleanup; queued handles
    /// without dependents are cleaned; active handles with no owning parent
    /// that have not been touched within the leak threshold are marked leaked.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl();
        let leak_threshold = self.config.leak_threshold();
        let mut report = SweepReport::default();
        let mut to_clean = Vec::new();

        for (id, entry) in self.entries() {
            let mut entry = entry.lock();
            let unused_for = now.saturating_duration_since(entry.last_used_at);
            match entry.state {
                ResourceState::Idle if unused_for >= idle_ttl => {
                    entry.state = ResourceState::CleanupPending;
                    report.queued_for_cleanup += 1;
                    to_clean.push(id);
                }
                ResourceState::CleanupPending => to_clean.push(id),
                ResourceState::Active
                    if entry.parent.is_none() && unused_for >= leak_threshold =>
                {
                    entry.state = ResourceState::Leaked;
                    report.newly_leaked += 1;
                    self.leaked_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        id,
                        kind = ?entry.kind,
                        label = %entry.label,
                        unused_secs = unused_for.as_secs(),
                        "Resource appears leaked"
                    );
                }
                _ => {}
            }
        }

        for id in to_clean {
            match self.cleanup(id) {
                Ok(()) => report.cleaned += 1,
                Err(e) => debug!(id, error = %e, "Deferred cleanup"),
            }
        }
        report
    }

    /// Spawn the single background sweep loop.
    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = self.config.sweep_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = tracker.sweep();
                        if report != SweepReport::default() {
                            debug!(?report, "Resource sweep");
                        }
                    }
                }
            }
            info!("Resource sweeper stopped");
        })
    }
}

fn remove_path(kind: ResourceKind, path: &PathBuf) -> Result<()> {
    let result = match kind {
        ResourceKind::TempDir => std::fs::remove_dir_all(path),
        _ => std::fs::remove_file(path),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::filesystem(path.clone(), e)),
    }
}
