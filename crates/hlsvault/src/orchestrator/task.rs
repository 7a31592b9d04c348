use std::path::PathBuf;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::{EngineEvent, EventBus};
use crate::error::Result;
use crate::model::{DownloadTask, Priority, TaskId, TaskStatus};
use crate::playlist::VariantSelectionPolicy;

/// Everything needed to register a download.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub url: String,
    /// Relative paths are resolved against the configured output directory.
    pub output_path: PathBuf,
    pub name: Option<String>,
    /// Reusing the id of an interrupted run resumes it from its recovery state.
    pub task_id: Option<TaskId>,
    pub priority: Priority,
    pub headers: Vec<(String, String)>,
    pub variant_policy: VariantSelectionPolicy,
}

impl TaskRequest {
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
            name: None,
            task_id: None,
            priority: Priority::default(),
            headers: Vec::new(),
            variant_policy: VariantSelectionPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_variant_policy(mut self, policy: VariantSelectionPolicy) -> Self {
        self.variant_policy = policy;
        self
    }
}

/// What the owner of a running task has been asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Run,
    /// Finish in-flight segments, then stop with state kept.
    Pause,
    /// Abort in-flight segments and discard everything.
    Cancel,
}

/// Registry entry for one task. The runner owns the task while it runs;
/// everyone else reads snapshots and sends control signals.
pub(crate) struct TaskHandle {
    state: Mutex<DownloadTask>,
    control: watch::Sender<TaskControl>,
    pub(crate) headers: HeaderMap,
    pub(crate) variant_policy: VariantSelectionPolicy,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub(crate) fn new(
        task: DownloadTask,
        headers: HeaderMap,
        variant_policy: VariantSelectionPolicy,
    ) -> Self {
        let (control, _) = watch::channel(TaskControl::Run);
        Self {
            state: Mutex::new(task),
            control,
            headers,
            variant_policy,
            runner: Mutex::new(None),
        }
    }

    pub(crate) fn snapshot(&self) -> DownloadTask {
        self.state.lock().clone()
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.state.lock().task_id.clone()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut DownloadTask) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Apply a status change and announce it.
    pub(crate) fn transition(&self, next: TaskStatus, events: &EventBus) -> Result<TaskStatus> {
        let (task_id, old) = {
            let mut task = self.state.lock();
            let old = task.transition(next)?;
            (task.task_id.clone(), old)
        };
        debug!(task_id = %task_id, from = %old, to = %next, "Task status changed");
        events.publish(EngineEvent::StatusChanged {
            task_id,
            old,
            new: next,
        });
        Ok(old)
    }

    pub(crate) fn signal(&self, control: TaskControl) {
        self.control.send_replace(control);
    }

    pub(crate) fn control(&self) -> TaskControl {
        *self.control.borrow()
    }

    pub(crate) fn subscribe_control(&self) -> watch::Receiver<TaskControl> {
        self.control.subscribe()
    }

    pub(crate) fn set_runner(&self, handle: JoinHandle<()>) {
        *self.runner.lock() = Some(handle);
    }

    pub(crate) fn take_runner(&self) -> Option<JoinHandle<()>> {
        self.runner.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn handle() -> TaskHandle {
        let task = DownloadTask::new(
            "t1".into(),
            "video".into(),
            Url::parse("https://cdn.example.com/index.m3u8").unwrap(),
            PathBuf::from("video.ts"),
            Priority::Normal,
            Vec::new(),
        );
        TaskHandle::new(task, HeaderMap::new(), VariantSelectionPolicy::default())
    }

    #[test]
    fn transitions_are_announced() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let handle = handle();

        handle.transition(TaskStatus::Running, &events).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::StatusChanged {
                task_id: "t1".into(),
                old: TaskStatus::Pending,
                new: TaskStatus::Running,
            }
        );
        assert!(handle.snapshot().started_at.is_some());
    }

    #[test]
    fn rejected_transitions_publish_nothing() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let handle = handle();

        assert!(handle.transition(TaskStatus::Completed, &events).is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.status(), TaskStatus::Pending);
    }

    #[test]
    fn latest_control_signal_wins() {
        let handle = handle();
        let rx = handle.subscribe_control();
        handle.signal(TaskControl::Pause);
        handle.signal(TaskControl::Run);
        assert_eq!(*rx.borrow(), TaskControl::Run);
        assert_eq!(handle.control(), TaskControl::Run);
    }

    #[test]
    fn request_builder() {
        let request = TaskRequest::new("https://a/index.m3u8", "out.ts")
            .with_task_id("abc")
            .with_priority(Priority::High)
            .with_header("Referer", "https://a/");
        assert_eq!(request.task_id.as_deref(), Some("abc"));
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.headers.len(), 1);
    }
}
