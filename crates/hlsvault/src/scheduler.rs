//! Task queue and dispatcher.
//!
//! One dispatcher task owns the [`TaskQueue`]; everything else talks to it
//! through [`SchedulerHandle`]. A task is launched only once a task slot is
//! free, and it holds that slot for as long as its runner lives.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DownloadError, Result};
use crate::model::{Priority, TaskId};

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: Reverse<u64>,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of task ids: higher priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    /// Live sequence number per queued task. Heap entries with any other
    /// sequence number are stale and skipped on pop.
    queued: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task. Re-queueing an already queued task moves it to the back
    /// of its (possibly new) priority.
    pub fn push(&mut self, task_id: TaskId, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(task_id.clone(), seq);
        self.heap.push(QueueEntry {
            priority,
            seq: Reverse(seq),
            task_id,
        });
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let removed = self.queued.remove(task_id).is_some();
        if self.queued.is_empty() {
            self.heap.clear();
        }
        removed
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        while let Some(entry) = self.heap.pop() {
            if self.queued.get(&entry.task_id) == Some(&entry.seq.0) {
                self.queued.remove(&entry.task_id);
                return Some(entry.task_id);
            }
        }
        None
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.queued.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    Enqueue { task_id: TaskId, priority: Priority },
    Remove { task_id: TaskId },
}

/// Starts a dequeued task. The permit must live as long as the task runs.
pub trait TaskLauncher: Send + Sync + 'static {
    fn launch(&self, task_id: TaskId, slot: OwnedSemaphorePermit);
}

#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    slots: Arc<Semaphore>,
}

impl SchedulerHandle {
    pub fn enqueue(&self, task_id: TaskId, priority: Priority) -> Result<()> {
        self.send(SchedulerCommand::Enqueue { task_id, priority })
    }

    pub fn remove(&self, task_id: TaskId) -> Result<()> {
        self.send(SchedulerCommand::Remove { task_id })
    }

    /// Free task slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| DownloadError::resource("task scheduler is not running"))
    }
}

/// The receiving half of the scheduler, waiting to be spawned.
#[derive(Debug)]
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    slots: Arc<Semaphore>,
}

/// Create a scheduler. Commands sent through the handle are buffered until
/// the dispatcher is spawned.
pub fn scheduler(max_concurrent_tasks: usize) -> (SchedulerHandle, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let slots = Arc::new(Semaphore::new(max_concurrent_tasks));
    (
        SchedulerHandle {
            tx,
            slots: Arc::clone(&slots),
        },
        Dispatcher { rx, slots },
    )
}

impl Dispatcher {
    /// Run the dispatch loop. It stops when `token` is cancelled or every
    /// handle is dropped.
    pub fn spawn(self, launcher: Arc<dyn TaskLauncher>, token: CancellationToken) -> JoinHandle<()> {
        let Dispatcher { mut rx, slots } = self;
        tokio::spawn(async move {
            let mut queue = TaskQueue::new();
            info!(slots = slots.available_permits(), "Task dispatcher started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(SchedulerCommand::Enqueue { task_id, priority }) => {
                            debug!(task_id = %task_id, ?priority, queued = queue.len() + 1, "Task queued");
                            queue.push(task_id, priority);
                        }
                        Some(SchedulerCommand::Remove { task_id }) => {
                            if queue.remove(&task_id) {
                                debug!(task_id = %task_id, "Task dequeued");
                            }
                        }
                        None => break,
                    },
                    permit = Arc::clone(&slots).acquire_owned(), if !queue.is_empty() => {
                        let Ok(permit) = permit else { break };
                        if let Some(task_id) = queue.pop() {
                            debug!(task_id = %task_id, remaining = queue.len(), "Launching task");
                            launcher.launch(task_id, permit);
                        }
                    }
                }
            }
            slots.close();
            info!("Task dispatcher stopped");
        })
    }
}
