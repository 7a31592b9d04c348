//! The owner of one running task.
//!
//! A runner is spawned when the scheduler grants the task a slot and holds
//! that slot until it exits. It is the only writer of the task's progress;
//! the orchestrator talks to it through the task's control channel.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, ProgressUpdate};
use super::segment::{SegmentWorker, WorkItem, artifact_path};
use super::services::EngineServices;
use super::task::{TaskControl, TaskHandle};
use crate::config::EngineConfig;
use crate::error::{DownloadError, Result, Severity};
use crate::merger::{ArtifactKind, SegmentArtifact};
use crate::metrics::SpeedMeter;
use crate::model::{Stream, TaskId, TaskStatus};
use crate::net::host_key;
use crate::playlist::ResolvedStream;
use crate::recovery::storage_key;
use crate::resilience::{ErrorContext, GiveUpReason, RequestKind, RetryDecision};
use crate::resources::{ResourceId, ResourceKind};

const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Directory holding a task's segment artifacts between runs.
pub(crate) fn task_dir(config: &EngineConfig, task_id: &str) -> PathBuf {
    config.paths.temp_dir.join(storage_key(task_id))
}

/// Delete a task's artifacts and recovery state. Used when a task is
/// cancelled, running or not.
pub(crate) async fn discard_artifacts(
    services: &EngineServices,
    task_id: &str,
    workspace: Option<ResourceId>,
) {
    let resources = &services.resources;
    let root = workspace.unwrap_or_else(|| {
        resources.register_path(
            ResourceKind::TempDir,
            format!("{task_id} segments"),
            task_dir(&services.config, task_id),
        )
    });
    if let Err(e) = resources.cleanup_tree(root) {
        warn!(task_id, error = %e, "Failed to remove segment artifacts");
    }
    if let Err(e) = services.recovery.finalize(task_id).await {
        warn!(task_id, error = %e, "Failed to remove recovery state");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Pause,
    Cancel,
    Budget,
}

enum RunEnd {
    Finished {
        artifacts: Vec<SegmentArtifact>,
        skipped: Vec<u64>,
    },
    Stopped(Stop),
    Failed(DownloadError),
}

/// One try at a work item.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    item: WorkItem,
    /// Attempts already spent on the item.
    attempts: u32,
    circuit_deferrals: u32,
}

impl Attempt {
    fn first(item: WorkItem) -> Self {
        Self {
            item,
            attempts: 0,
            circuit_deferrals: 0,
        }
    }
}

enum FailureAction {
    Requeue(Attempt),
    Wait(Duration, Attempt),
    Skip(u64),
    Fail(DownloadError),
}

struct Workspace {
    dir: PathBuf,
    resource: ResourceId,
}

struct Plan {
    done: BTreeMap<ArtifactKind, SegmentArtifact>,
    pending: Vec<WorkItem>,
}

type Delayed = Pin<Box<dyn Future<Output = Attempt> + Send>>;
type InFlight = Pin<Box<dyn Future<Output = (Attempt, Result<SegmentArtifact>)> + Send>>;

async fn budget_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves once the control channel asks the runner to stop.
async fn stop_requested(control: &mut watch::Receiver<TaskControl>) -> Stop {
    loop {
        match *control.borrow_and_update() {
            TaskControl::Run => {}
            TaskControl::Pause => return Stop::Pause,
            TaskControl::Cancel => return Stop::Cancel,
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) struct TaskRunner {
    services: Arc<EngineServices>,
    handle: Arc<TaskHandle>,
    task_id: TaskId,
    token: CancellationToken,
    workspace: Option<Workspace>,
    _slot: OwnedSemaphorePermit,
}

impl TaskRunner {
    pub(crate) fn new(
        services: Arc<EngineServices>,
        handle: Arc<TaskHandle>,
        token: CancellationToken,
        slot: OwnedSemaphorePermit,
    ) -> Self {
        let task_id = handle.task_id();
        Self {
            services,
            handle,
            task_id,
            token,
            workspace: None,
            _slot: slot,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self
            .handle
            .transition(TaskStatus::Running, &self.services.events)
        {
            debug!(task_id = %self.task_id, error = %e, "Task is no longer runnable");
            return;
        }
        info!(task_id = %self.task_id, "Task started");

        let deadline = self.services.config.task_budget().map(|b| Instant::now() + b);
        let mut control = self.handle.subscribe_control();
        let end = self.drive(&mut control, deadline).await;
        self.settle(end).await;
    }

    async fn drive(
        &mut self,
        control: &mut watch::Receiver<TaskControl>,
        deadline: Option<Instant>,
    ) -> RunEnd {
        let resolved = tokio::select! {
            biased;
            stop = stop_requested(control) => {
                self.token.cancel();
                return RunEnd::Stopped(stop);
            }
            _ = budget_elapsed(deadline) => {
                self.token.cancel();
                return RunEnd::Stopped(Stop::Budget);
            }
            resolved = self.resolve() => match resolved {
                Ok(resolved) => resolved,
                // engine shutdown while resolving
                Err(DownloadError::Cancelled) => return RunEnd::Stopped(Stop::Pause),
                Err(e) => return RunEnd::Failed(e),
            },
        };

        let stream = Arc::new(resolved.stream);
        let total = stream.segments.len() as u64;
        self.handle.update(|task| {
            task.source_stream = Some(Arc::clone(&stream));
            task.total_segments = total;
        });
        info!(
            task_id = %self.task_id,
            segments = total,
            bandwidth = stream.bandwidth,
            encrypted = stream.encryption.is_encrypted(),
            live = stream.is_live,
            "Stream resolved"
        );

        let plan = match self.plan(&stream, &resolved.checksum).await {
            Ok(plan) => plan,
            Err(e) => return RunEnd::Failed(e),
        };
        self.download(stream, plan, control, deadline).await
    }

    /// Load the playlist, retrying through the coordinator.
    async fn resolve(&self) -> Result<ResolvedStream> {
        let url = self.handle.snapshot().source_url;
        let host = host_key(&url).ok();
        let mut attempts = 0u32;
        let mut circuit_deferrals = 0u32;

        loop {
            let error = match self
                .services
                .parser
                .resolve_stream(&url, &self.handle.headers, &self.handle.variant_policy, &self.token)
                .await
            {
                Ok(resolved) => return Ok(resolved),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) => e,
            };
            attempts += 1;

            let decision = self.services.retry.decide(&ErrorContext {
                error: &error,
                kind: RequestKind::Playlist,
                host: host.as_deref(),
                attempt: attempts,
                circuit_deferrals,
                task_id: &self.task_id,
                segment: None,
            });
            let wait = match decision {
                RetryDecision::RetryNow => Duration::ZERO,
                RetryDecision::RetryAfter(wait) => wait,
                RetryDecision::Defer(wait) => {
                    attempts -= 1;
                    circuit_deferrals += 1;
                    wait
                }
                RetryDecision::GiveUp(reason) => {
                    warn!(task_id = %self.task_id, ?reason, error = %error, "Giving up on playlist");
                    return Err(error);
                }
            };
            warn!(
                task_id = %self.task_id,
                attempt = attempts,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Playlist fetch failed, retrying"
            );
            tokio::select! {
                _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Prepare the artifact directory and work out what is left to fetch.
    async fn plan(&mut self, stream: &Stream, checksum: &str) -> Result<Plan> {
        let services = Arc::clone(&self.services);
        let dir = task_dir(&services.config, &self.task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::filesystem(&dir, e))?;
        let resource = services.resources.register_path(
            ResourceKind::TempDir,
            format!("{} segments", self.task_id),
            dir.clone(),
        );
        services.resources.touch(resource)?;
        self.workspace = Some(Workspace {
            dir: dir.clone(),
            resource,
        });

        let total = stream.segments.len() as u64;
        let (session, resumed) = services
            .recovery
            .begin(&self.task_id, total, checksum)
            .await?;
        if !resumed {
            // leftovers from another playlist must not be merged
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| DownloadError::filesystem(&dir, e))?;
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| DownloadError::filesystem(&dir, e))?;
        }

        let mut done = BTreeMap::new();
        let mut pending = Vec::new();
        let mut items = Vec::with_capacity(stream.segments.len() + 1);
        if stream.init_section.is_some() {
            items.push(WorkItem::Init);
        }
        items.extend((0..total).map(WorkItem::Media));

        for item in items {
            let recorded = match item {
                WorkItem::Init => true,
                WorkItem::Media(index) => session.is_complete(index),
            };
            let existing = if resumed && recorded {
                existing_artifact(&dir, item).await
            } else {
                None
            };
            match existing {
                Some(artifact) => {
                    let file = services.resources.register_path(
                        ResourceKind::TempFile,
                        format!("{} {item}", self.task_id),
                        artifact.path.clone(),
                    );
                    services.resources.add_dependent(resource, file)?;
                    services.resources.touch(file)?;
                    done.insert(artifact.kind, artifact);
                }
                None => pending.push(item),
            }
        }

        let resumed_segments = done
            .keys()
            .filter(|k| matches!(k, ArtifactKind::Media(_)))
            .count() as u64;
        let resumed_bytes: u64 = done.values().map(|a| a.len).sum();
        if resumed_segments > 0 {
            services.metrics.record_segments_resumed(resumed_segments);
            info!(
                task_id = %self.task_id,
                resumed = resumed_segments,
                remaining = pending.len(),
                "Skipping segments already on disk"
            );
        }
        self.handle.update(|task| {
            task.completed_segment_count = resumed_segments;
            task.failed_segment_count = 0;
            task.bytes_downloaded = resumed_bytes;
        });
        self.publish_progress(None);

        Ok(Plan { done, pending })
    }

    async fn download(
        &mut self,
        stream: Arc<Stream>,
        plan: Plan,
        control: &mut watch::Receiver<TaskControl>,
        deadline: Option<Instant>,
    ) -> RunEnd {
        let Some(workspace) = self.workspace.as_ref() else {
            return RunEnd::Failed(DownloadError::resource("task workspace missing"));
        };
        let services = Arc::clone(&self.services);
        let worker = Arc::new(SegmentWorker::new(
            Arc::clone(&services),
            Arc::clone(&stream),
            self.handle.headers.clone(),
            workspace.dir.clone(),
            workspace.resource,
            self.task_id.clone(),
            self.token.clone(),
        ));
        let max_workers = services.config.concurrency.max_workers_per_task;
        let tolerance = services.config.retry.segment_failure_tolerance;
        let progress_interval = Duration::from_millis(services.config.events.progress_interval_ms);

        let Plan { mut done, pending } = plan;
        let mut queue: VecDeque<Attempt> = pending.into_iter().map(Attempt::first).collect();
        let mut waiting: FuturesUnordered<Delayed> = FuturesUnordered::new();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut skipped = Vec::new();
        let mut stop: Option<Stop> = None;
        let mut control_open = true;
        let mut meter = SpeedMeter::new(SPEED_WINDOW);
        let mut last_progress: Option<Instant> = None;

        loop {
            if stop.is_none() {
                while in_flight.len() < max_workers {
                    let Some(attempt) = queue.pop_front() else {
                        break;
                    };
                    let worker = Arc::clone(&worker);
                    in_flight.push(Box::pin(async move {
                        let result = worker.run(attempt.item).await;
                        (attempt, result)
                    }));
                }
            }
            let idle = queue.is_empty() && waiting.is_empty();
            if in_flight.is_empty() && (stop.is_some() || idle) {
                break;
            }

            tokio::select! {
                biased;
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                        continue;
                    }
                    let requested = *control.borrow_and_update();
                    match (requested, stop) {
                        (TaskControl::Run, Some(Stop::Pause)) => {
                            info!(task_id = %self.task_id, "Pause withdrawn");
                            stop = None;
                        }
                        (TaskControl::Pause, None) => {
                            info!(task_id = %self.task_id, in_flight = in_flight.len(), "Pausing after in-flight segments");
                            stop = Some(Stop::Pause);
                        }
                        (TaskControl::Cancel, Some(Stop::Cancel | Stop::Budget)) => {}
                        (TaskControl::Cancel, _) => {
                            info!(task_id = %self.task_id, "Cancelling");
                            stop = Some(Stop::Cancel);
                            self.token.cancel();
                        }
                        _ => {}
                    }
                }
                _ = budget_elapsed(deadline), if !matches!(stop, Some(Stop::Cancel | Stop::Budget)) => {
                    warn!(task_id = %self.task_id, "Task time budget exhausted");
                    stop = Some(Stop::Budget);
                    self.token.cancel();
                }
                Some(attempt) = waiting.next(), if !waiting.is_empty() => {
                    queue.push_back(attempt);
                }
                Some((attempt, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(artifact) => {
                            if let WorkItem::Media(index) = attempt.item {
                                if let Err(e) = services.recovery.mark_complete(&self.task_id, index).await {
                                    self.token.cancel();
                                    return self.engine_failure(e);
                                }
                                services.metrics.record_segment_completed();
                            }
                            meter.record(artifact.len);
                            let len = artifact.len;
                            let is_media = matches!(artifact.kind, ArtifactKind::Media(_));
                            done.insert(artifact.kind, artifact);
                            self.handle.update(|task| {
                                if is_media {
                                    task.completed_segment_count += 1;
                                }
                                task.bytes_downloaded += len;
                            });
                            let last = queue.is_empty() && in_flight.is_empty() && waiting.is_empty();
                            let due = last
                                || last_progress.is_none_or(|at| at.elapsed() >= progress_interval);
                            if due {
                                last_progress = Some(Instant::now());
                                self.publish_progress(Some(&mut meter));
                            }
                        }
                        Err(DownloadError::Cancelled) => {
                            // the run token fired: cancel, budget or engine shutdown
                            queue.push_back(attempt);
                            if stop.is_none() {
                                stop = Some(Stop::Pause);
                            }
                        }
                        Err(e) if e.severity() == Severity::Engine => {
                            self.token.cancel();
                            return self.engine_failure(e);
                        }
                        Err(e) => match self.on_failure(&worker, attempt, e) {
                            FailureAction::Requeue(next) => queue.push_back(next),
                            FailureAction::Wait(wait, next) => {
                                waiting.push(Box::pin(async move {
                                    tokio::time::sleep(wait).await;
                                    next
                                }));
                            }
                            FailureAction::Skip(index) => {
                                skipped.push(index);
                                let failed = skipped.len() as u64;
                                self.handle.update(|task| task.failed_segment_count = failed);
                                warn!(
                                    task_id = %self.task_id,
                                    segment = index,
                                    failed,
                                    tolerance,
                                    "Segment skipped within failure tolerance"
                                );
                            }
                            FailureAction::Fail(e) => {
                                self.token.cancel();
                                return RunEnd::Failed(e);
                            }
                        },
                    }
                }
            }
        }

        let unfinished = !queue.is_empty() || !waiting.is_empty();
        match stop {
            Some(Stop::Pause) if !unfinished => {
                debug!(task_id = %self.task_id, "Pause arrived after the last segment");
            }
            Some(stop) => return RunEnd::Stopped(stop),
            None => {}
        }
        skipped.sort_unstable();
        RunEnd::Finished {
            artifacts: done.into_values().collect(),
            skipped,
        }
    }

    /// Route a failed attempt through the retry coordinator. The only place
    /// a segment failure is decided.
    fn on_failure(&self, worker: &SegmentWorker, attempt: Attempt, error: DownloadError) -> FailureAction {
        let (kind, host) = worker.failure_origin(attempt.item, &error);
        let attempts = attempt.attempts + 1;
        let decision = self.services.retry.decide(&ErrorContext {
            error: &error,
            kind,
            host: host.as_deref(),
            attempt: attempts,
            circuit_deferrals: attempt.circuit_deferrals,
            task_id: &self.task_id,
            segment: attempt.item.segment_index(),
        });

        let retried = Attempt {
            attempts,
            ..attempt
        };
        match decision {
            RetryDecision::RetryNow => {
                self.services.metrics.record_segment_retry();
                debug!(task_id = %self.task_id, item = %attempt.item, error = %error, "Retrying now");
                FailureAction::Requeue(retried)
            }
            RetryDecision::RetryAfter(wait) => {
                self.services.metrics.record_segment_retry();
                debug!(
                    task_id = %self.task_id,
                    item = %attempt.item,
                    attempt = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "Retrying after backoff"
                );
                FailureAction::Wait(wait, retried)
            }
            RetryDecision::Defer(wait) => {
                debug!(
                    task_id = %self.task_id,
                    item = %attempt.item,
                    wait_ms = wait.as_millis() as u64,
                    "Host circuit open, deferring"
                );
                FailureAction::Wait(
                    wait,
                    Attempt {
                        circuit_deferrals: attempt.circuit_deferrals + 1,
                        ..attempt
                    },
                )
            }
            RetryDecision::GiveUp(reason) => {
                self.services.metrics.record_segment_failed();
                warn!(
                    task_id = %self.task_id,
                    item = %attempt.item,
                    ?reason,
                    error = %error,
                    "Giving up on segment"
                );
                let tolerance = self.services.config.retry.segment_failure_tolerance;
                let failed_so_far = self.handle.snapshot().failed_segment_count;
                match attempt.item {
                    WorkItem::Media(index) if failed_so_far < tolerance => FailureAction::Skip(index),
                    _ => {
                        if reason == GiveUpReason::CircuitStuck {
                            debug!(task_id = %self.task_id, "Host never recovered");
                        }
                        FailureAction::Fail(error)
                    }
                }
            }
        }
    }

    fn engine_failure(&self, error: DownloadError) -> RunEnd {
        self.services.events.publish(EngineEvent::EngineAlert {
            task_id: Some(self.task_id.clone()),
            report: error.report(),
        });
        RunEnd::Failed(error)
    }

    fn publish_progress(&self, meter: Option<&mut SpeedMeter>) {
        let task = self.handle.snapshot();
        let (speed, eta) = match meter {
            Some(meter) => {
                let eta = meter.eta(
                    task.completed_segment_count,
                    task.total_segments,
                    task.bytes_downloaded,
                );
                (meter.bytes_per_sec(), eta)
            }
            None => (0.0, None),
        };
        self.services
            .events
            .publish(EngineEvent::Progress(ProgressUpdate {
                task_id: self.task_id.clone(),
                completed: task.completed_segment_count,
                total: task.total_segments,
                bytes_downloaded: task.bytes_downloaded,
                speed_bytes_per_sec: speed,
                eta,
            }));
    }

    async fn settle(mut self, end: RunEnd) {
        match end {
            RunEnd::Finished { artifacts, skipped } => self.complete(artifacts, skipped).await,
            RunEnd::Stopped(Stop::Pause) => self.park().await,
            RunEnd::Stopped(Stop::Cancel) => self.discard().await,
            RunEnd::Stopped(Stop::Budget) => {
                let budget = self.services.config.task_budget().unwrap_or_default();
                self.fail(DownloadError::TimeoutExceeded { budget }).await
            }
            RunEnd::Failed(error) => self.fail(error).await,
        }
    }

    async fn complete(&mut self, artifacts: Vec<SegmentArtifact>, skipped: Vec<u64>) {
        let output = self.handle.snapshot().output_path;
        let report = match self.services.merger.merge(&artifacts, &output).await {
            Ok(report) => report,
            Err(e) => {
                if e.severity() == Severity::Engine {
                    self.services.events.publish(EngineEvent::EngineAlert {
                        task_id: Some(self.task_id.clone()),
                        report: e.report(),
                    });
                }
                return self.fail(e).await;
            }
        };

        if let Err(e) = self.services.recovery.finalize(&self.task_id).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to remove recovery state");
        }
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = self.services.resources.cleanup_tree(workspace.resource) {
                warn!(task_id = %self.task_id, error = %e, "Failed to remove segment artifacts");
            }
        }

        let message = if skipped.is_empty() {
            format!(
                "downloaded {} bytes to {}",
                report.bytes_written,
                output.display()
            )
        } else {
            format!(
                "downloaded {} bytes to {} with {} segments missing: {:?}",
                report.bytes_written,
                output.display(),
                skipped.len(),
                skipped
            )
        };
        if let Err(e) = self
            .handle
            .transition(TaskStatus::Completed, &self.services.events)
        {
            warn!(task_id = %self.task_id, error = %e, "Could not mark task completed");
            return;
        }
        info!(task_id = %self.task_id, bytes = report.bytes_written, output = %output.display(), "Task completed");
        self.services.events.publish(EngineEvent::Completed {
            task_id: self.task_id.clone(),
            success: true,
            message,
            failure: None,
        });
    }

    /// Keep artifacts and recovery state for a later resume.
    fn keep_artifacts(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = self.services.resources.release_tree(workspace.resource) {
                debug!(task_id = %self.task_id, error = %e, "Failed to release artifacts");
            }
        }
        self.services.recovery.close(&self.task_id);
    }

    async fn park(&mut self) {
        self.keep_artifacts();
        if let Err(e) = self
            .handle
            .transition(TaskStatus::Paused, &self.services.events)
        {
            warn!(task_id = %self.task_id, error = %e, "Could not mark task paused");
            return;
        }
        let task = self.handle.snapshot();
        info!(
            task_id = %self.task_id,
            completed = task.completed_segment_count,
            total = task.total_segments,
            "Task paused"
        );
    }

    async fn discard(&mut self) {
        let workspace = self.workspace.take().map(|w| w.resource);
        discard_artifacts(&self.services, &self.task_id, workspace).await;
        if let Err(e) = self
            .handle
            .transition(TaskStatus::Cancelled, &self.services.events)
        {
            warn!(task_id = %self.task_id, error = %e, "Could not mark task cancelled");
            return;
        }
        info!(task_id = %self.task_id, "Task cancelled");
        self.services.events.publish(EngineEvent::Completed {
            task_id: self.task_id.clone(),
            success: false,
            message: "cancelled".to_string(),
            failure: None,
        });
    }

    async fn fail(&mut self, error: DownloadError) {
        self.keep_artifacts();
        let report = error.report();
        self.handle
            .update(|task| task.last_error = Some(report.clone()));
        if let Err(e) = self
            .handle
            .transition(TaskStatus::Failed, &self.services.events)
        {
            warn!(task_id = %self.task_id, error = %e, "Could not mark task failed");
            return;
        }
        warn!(
            task_id = %self.task_id,
            category = ?report.category,
            error = %error,
            "Task failed"
        );
        self.services.events.publish(EngineEvent::Completed {
            task_id: self.task_id.clone(),
            success: false,
            message: report.message.clone(),
            failure: Some(report),
        });
    }
}

async fn existing_artifact(dir: &Path, item: WorkItem) -> Option<SegmentArtifact> {
    let path = artifact_path(dir, item);
    let meta = tokio::fs::metadata(&path).await.ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    Some(SegmentArtifact {
        kind: item.artifact_kind(),
        path,
        len: meta.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_artifacts_must_be_non_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(existing_artifact(dir.path(), WorkItem::Media(0)).await.is_none());

        tokio::fs::write(artifact_path(dir.path(), WorkItem::Media(0)), b"")
            .await
            .unwrap();
        assert!(existing_artifact(dir.path(), WorkItem::Media(0)).await.is_none());

        tokio::fs::write(artifact_path(dir.path(), WorkItem::Media(1)), b"abc")
            .await
            .unwrap();
        let artifact = existing_artifact(dir.path(), WorkItem::Media(1)).await.unwrap();
        assert_eq!(artifact.len, 3);
        assert_eq!(artifact.kind, ArtifactKind::Media(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_requested_sees_latest_signal() {
        let (tx, mut rx) = watch::channel(TaskControl::Run);
        let waiter = tokio::spawn(async move { stop_requested(&mut rx).await });
        tokio::task::yield_now().await;
        tx.send_replace(TaskControl::Cancel);
        assert_eq!(waiter.await.unwrap(), Stop::Cancel);
    }

    #[test]
    fn task_dirs_use_storage_keys() {
        let config = EngineConfig::default();
        let dir = task_dir(&config, "a/b");
        assert!(dir.starts_with(&config.paths.temp_dir));
        assert_ne!(dir.file_name().unwrap(), "a/b");
    }
}
