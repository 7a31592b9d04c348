//! Task orchestration: registration, lifecycle control, event fan-out.
//!
//! [`DownloadOrchestrator`] is the public surface of the engine. It owns the
//! task registry and the scheduler; each launched task is driven by its own
//! runner, which owns the task's progress until it settles.

mod events;
mod runner;
mod segment;
mod services;
mod task;

pub use events::{EngineEvent, EventBus, EventListener, ProgressUpdate};
pub use services::EngineServices;
pub use task::{TaskControl, TaskRequest};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{EngineConfig, parse_headers};
use crate::error::{DownloadError, Result};
use crate::metrics::MetricsSnapshot;
use crate::model::{DownloadTask, TaskId, TaskStatus};
use crate::net::HostHealthRecord;
use crate::resources::ResourceStats;
use crate::scheduler::{Dispatcher, SchedulerHandle, TaskLauncher, scheduler};
use runner::{TaskRunner, discard_artifacts};
use task::TaskHandle;

type Registry = DashMap<TaskId, Arc<TaskHandle>>;

/// Starts runners for tasks the dispatcher hands out.
struct Launcher {
    services: Arc<EngineServices>,
    tasks: Arc<Registry>,
    root: CancellationToken,
}

impl TaskLauncher for Launcher {
    fn launch(&self, task_id: TaskId, slot: OwnedSemaphorePermit) {
        let Some(handle) = self.tasks.get(&task_id).map(|h| Arc::clone(h.value())) else {
            debug!(task_id = %task_id, "Dequeued task was removed");
            return;
        };
        let runner = TaskRunner::new(
            Arc::clone(&self.services),
            Arc::clone(&handle),
            self.root.child_token(),
            slot,
        );
        handle.set_runner(tokio::spawn(runner.run()));
    }
}

pub struct DownloadOrchestrator {
    services: Arc<EngineServices>,
    tasks: Arc<Registry>,
    scheduler: SchedulerHandle,
    dispatcher: Mutex<Option<Dispatcher>>,
    root: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadOrchestrator {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self::with_services(EngineServices::from_config(config)?))
    }

    /// Build around caller-assembled services.
    pub fn with_services(services: EngineServices) -> Self {
        let (scheduler, dispatcher) =
            scheduler(services.config.concurrency.max_concurrent_tasks);
        Self {
            services: Arc::new(services),
            tasks: Arc::new(DashMap::new()),
            scheduler,
            dispatcher: Mutex::new(Some(dispatcher)),
            root: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Start dispatching queued tasks and the background sweeps.
    pub fn start(&self) -> Result<()> {
        let dispatcher = self.dispatcher.lock().take().ok_or_else(|| {
            DownloadError::configuration("orchestrator already started")
        })?;
        let launcher = Arc::new(Launcher {
            services: Arc::clone(&self.services),
            tasks: Arc::clone(&self.tasks),
            root: self.root.clone(),
        });

        let mut background = self.background.lock();
        background.push(dispatcher.spawn(launcher, self.root.child_token()));
        background.push(
            self.services
                .resources
                .start_sweeper(self.root.child_token()),
        );
        background.push(self.services.pool.start_sweeper(self.root.child_token()));
        info!(
            max_tasks = self.services.config.concurrency.max_concurrent_tasks,
            workers_per_task = self.services.config.concurrency.max_workers_per_task,
            "Download engine started"
        );
        Ok(())
    }

    /// Register a task and queue it. Returns its id.
    pub fn add_task(&self, request: TaskRequest) -> Result<TaskId> {
        let url = Url::parse(&request.url).map_err(|e| {
            DownloadError::configuration(format!("invalid playlist URL `{}`: {e}", request.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::configuration(format!(
                "unsupported URL scheme `{}`",
                url.scheme()
            )));
        }
        let headers = parse_headers(&request.headers)?;
        let output_path = self.resolve_output(&request.output_path);

        if let Some(other) = self.tasks.iter().find(|entry| {
            let task = entry.value().snapshot();
            !task.status.is_terminal() && task.output_path == output_path
        }) {
            return Err(DownloadError::configuration(format!(
                "task `{}` already writes to {}",
                other.key(),
                output_path.display()
            )));
        }

        let task_id = request
            .task_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = request.name.unwrap_or_else(|| {
            output_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| task_id.clone())
        });
        let task = DownloadTask::new(
            task_id.clone(),
            name,
            url,
            output_path,
            request.priority,
            request.headers,
        );
        let priority = task.priority;

        match self.tasks.entry(task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DownloadError::configuration(format!(
                    "task id `{task_id}` is already registered"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(TaskHandle::new(
                    task,
                    headers,
                    request.variant_policy,
                )));
            }
        }

        if let Err(e) = self.scheduler.enqueue(task_id.clone(), priority) {
            self.tasks.remove(&task_id);
            return Err(e);
        }
        info!(task_id = %task_id, ?priority, "Task added");
        Ok(task_id)
    }

    fn resolve_output(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.services.config.paths.output_dir.join(path)
        }
    }

    fn handle(&self, task_id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks
            .get(task_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| DownloadError::task_not_found(task_id))
    }

    /// Pause a task. A queued task leaves the queue; a running task stops
    /// after its in-flight segments finish, keeping everything for resume.
    pub fn pause_task(&self, task_id: &str) -> Result<()> {
        let handle = self.handle(task_id)?;
        match handle.status() {
            TaskStatus::Pending => {
                handle.transition(TaskStatus::Paused, &self.services.events)?;
                self.scheduler.remove(task_id.to_string())?;
                Ok(())
            }
            TaskStatus::Running => {
                handle.signal(TaskControl::Pause);
                Ok(())
            }
            TaskStatus::Paused => Ok(()),
            from => Err(DownloadError::InvalidTransition {
                from,
                to: TaskStatus::Paused,
            }),
        }
    }

    /// Queue a paused or failed task again. Withdraws a pause that a running
    /// task has not acted on yet.
    pub fn resume_task(&self, task_id: &str) -> Result<()> {
        let handle = self.handle(task_id)?;
        match handle.status() {
            TaskStatus::Paused | TaskStatus::Failed => {
                handle.transition(TaskStatus::Pending, &self.services.events)?;
                handle.signal(TaskControl::Run);
                let priority = handle.snapshot().priority;
                self.scheduler.enqueue(task_id.to_string(), priority)
            }
            TaskStatus::Running => {
                if handle.control() == TaskControl::Pause {
                    handle.signal(TaskControl::Run);
                }
                Ok(())
            }
            TaskStatus::Pending => Ok(()),
            from => Err(DownloadError::InvalidTransition {
                from,
                to: TaskStatus::Pending,
            }),
        }
    }

    /// Cancel a task and delete its artifacts and recovery state.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let handle = self.handle(task_id)?;
        match handle.status() {
            TaskStatus::Running => {
                handle.signal(TaskControl::Cancel);
                Ok(())
            }
            TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Failed => {
                handle.transition(TaskStatus::Cancelled, &self.services.events)?;
                self.scheduler.remove(task_id.to_string())?;
                discard_artifacts(&self.services, task_id, None).await;
                self.services.events.publish(EngineEvent::Completed {
                    task_id: task_id.to_string(),
                    success: false,
                    message: "cancelled".to_string(),
                    failure: None,
                });
                info!(task_id, "Task cancelled");
                Ok(())
            }
            from => Err(DownloadError::InvalidTransition {
                from,
                to: TaskStatus::Cancelled,
            }),
        }
    }

    /// Drop a task from the registry. Running tasks must be paused or
    /// cancelled first; other unfinished tasks are cancelled.
    pub async fn remove_task(&self, task_id: &str) -> Result<DownloadTask> {
        let handle = self.handle(task_id)?;
        let status = handle.status();
        match status {
            TaskStatus::Running => {
                return Err(DownloadError::TaskActive {
                    task_id: task_id.to_string(),
                    status,
                });
            }
            TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Failed => {
                self.cancel_task(task_id).await?;
            }
            TaskStatus::Completed | TaskStatus::Cancelled => {}
        }
        self.tasks.remove(task_id);
        debug!(task_id, "Task removed");
        Ok(handle.snapshot())
    }

    pub fn get_status(&self, task_id: &str) -> Result<DownloadTask> {
        Ok(self.handle(task_id)?.snapshot())
    }

    /// Every registered task, oldest first.
    pub fn list_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|e| e.value().snapshot()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.events.subscribe()
    }

    /// Feed events to a callback listener until shutdown.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> JoinHandle<()> {
        self.services
            .events
            .spawn_listener(listener, self.root.child_token())
    }

    pub fn host_health(&self, host: &str) -> HostHealthRecord {
        HostHealthRecord {
            host: host.to_string(),
            latency: self.services.timeouts.stats(host),
            timeout: self.services.timeouts.timeout_for(host),
            breakers: self.services.breakers.host_status(host),
            pool: self.services.pool.host_stats(host),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.metrics.snapshot()
    }

    pub fn resource_stats(&self) -> ResourceStats {
        self.services.resources.stats()
    }

    /// Wait for a task to reach `Completed`, `Failed`, `Cancelled` or
    /// `Paused`, returning its final snapshot.
    pub async fn wait_for(&self, task_id: &str) -> Result<DownloadTask> {
        let mut events = self.subscribe();
        loop {
            let task = self.get_status(task_id)?;
            if task.status.is_terminal()
                || matches!(task.status, TaskStatus::Failed | TaskStatus::Paused)
            {
                return Ok(task);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.get_status(task_id),
            }
        }
    }

    /// Pause every running task, give runners `grace` to park, then stop
    /// all background work.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down download engine");
        let handles: Vec<Arc<TaskHandle>> =
            self.tasks.iter().map(|e| Arc::clone(e.value())).collect();
        for handle in &handles {
            if handle.status() == TaskStatus::Running {
                handle.signal(TaskControl::Pause);
            }
        }

        let runners: Vec<JoinHandle<()>> = handles.iter().filter_map(|h| h.take_runner()).collect();
        let drained = tokio::time::timeout(grace, futures::future::join_all(runners)).await;
        if drained.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "Runners still busy at shutdown, aborting in-flight work");
        }

        self.root.cancel();
        let background: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for join in background {
            let _ = join.await;
        }
        self.services.pool.close();
        self.services.metrics.log_summary();
    }
}

impl Drop for DownloadOrchestrator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
