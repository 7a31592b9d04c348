use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FailureReport;
use crate::model::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub completed: u64,
    pub total: u64,
    pub bytes_downloaded: u64,
    pub speed_bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Everything the engine tells collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress(ProgressUpdate),
    StatusChanged {
        task_id: TaskId,
        old: TaskStatus,
        new: TaskStatus,
    },
    /// Terminal outcome of a run: completed, failed or cancelled.
    Completed {
        task_id: TaskId,
        success: bool,
        message: String,
        failure: Option<FailureReport>,
    },
    /// An engine-severity failure the collaborator should act on.
    EngineAlert {
        task_id: Option<TaskId>,
        report: FailureReport,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Progress(p) => Some(&p.task_id),
            Self::StatusChanged { task_id, .. } | Self::Completed { task_id, .. } => Some(task_id),
            Self::EngineAlert { task_id, .. } => task_id.as_deref(),
        }
    }
}

/// Callback view of the event stream. Every method defaults to doing nothing.
pub trait EventListener: Send + Sync + 'static {
    fn on_progress(&self, _update: &ProgressUpdate) {}

    fn on_status_changed(&self, _task_id: &str, _old: TaskStatus, _new: TaskStatus) {}

    fn on_completed(
        &self,
        _task_id: &str,
        _success: bool,
        _message: &str,
        _failure: Option<&FailureReport>,
    ) {
    }

    fn on_engine_alert(&self, _task_id: Option<&str>, _report: &FailureReport) {}
}

fn dispatch(listener: &dyn EventListener, event: &EngineEvent) {
    match event {
        EngineEvent::Progress(update) => listener.on_progress(update),
        EngineEvent::StatusChanged { task_id, old, new } => {
            listener.on_status_changed(task_id, *old, *new)
        }
        EngineEvent::Completed {
            task_id,
            success,
            message,
            failure,
        } => listener.on_completed(task_id, *success, message, failure.as_ref()),
        EngineEvent::EngineAlert { task_id, report } => {
            listener.on_engine_alert(task_id.as_deref(), report)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of receivers reached; zero without subscribers.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Feed every event to `listener` on a background task until `token`
    /// is cancelled or the bus is dropped.
    pub fn spawn_listener(
        &self,
        listener: Arc<dyn EventListener>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => dispatch(listener.as_ref(), &event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event listener lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Event channel closed");
                            break;
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.seen
                .lock()
                .push(format!("progress {}/{}", update.completed, update.total));
        }

        fn on_status_changed(&self, task_id: &str, old: TaskStatus, new: TaskStatus) {
            self.seen.lock().push(format!("{task_id} {old}->{new}"));
        }

        fn on_completed(
            &self,
            task_id: &str,
            success: bool,
            _message: &str,
            _failure: Option<&FailureReport>,
        ) {
            self.seen.lock().push(format!("{task_id} done {success}"));
        }
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        assert_eq!(
            bus.publish(EngineEvent::StatusChanged {
                task_id: "t".into(),
                old: TaskStatus::Pending,
                new: TaskStatus::Running,
            }),
            0
        );
    }

    #[tokio::test]
    async fn listener_receives_events_in_order() {
        let bus = EventBus::new(16);
        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let handle = bus.spawn_listener(recorder.clone(), token.clone());

        bus.publish(EngineEvent::StatusChanged {
            task_id: "t".into(),
            old: TaskStatus::Pending,
            new: TaskStatus::Running,
        });
        bus.publish(EngineEvent::Progress(ProgressUpdate {
            task_id: "t".into(),
            completed: 1,
            total: 2,
            bytes_downloaded: 10,
            speed_bytes_per_sec: 0.0,
            eta: None,
        }));
        bus.publish(EngineEvent::Completed {
            task_id: "t".into(),
            success: true,
            message: "ok".into(),
            failure: None,
        });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(
            *recorder.seen.lock(),
            ["t pending->running", "progress 1/2", "t done true"]
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::StatusChanged {
            task_id: "t".into(),
            old: TaskStatus::Paused,
            new: TaskStatus::Pending,
        })
        .unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["new"], "pending");
    }
}
