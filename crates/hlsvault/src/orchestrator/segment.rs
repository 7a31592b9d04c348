use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::services::EngineServices;
use crate::crypto::KeyCache;
use crate::error::{DownloadError, EncryptionStage, Result};
use crate::merger::{ArtifactKind, SegmentArtifact};
use crate::model::{ByteRange, EncryptionDescriptor, EncryptionMethod, Stream, TaskId};
use crate::net::{FetchRequest, host_key};
use crate::resilience::RequestKind;
use crate::resources::{ResourceId, ResourceKind, ResourceTracker};

/// One unit of work inside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WorkItem {
    Init,
    Media(u64),
}

impl WorkItem {
    pub(crate) fn artifact_kind(self) -> ArtifactKind {
        match self {
            Self::Init => ArtifactKind::Init,
            Self::Media(index) => ArtifactKind::Media(index),
        }
    }

    pub(crate) fn segment_index(self) -> Option<u64> {
        match self {
            Self::Init => None,
            Self::Media(index) => Some(index),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init section"),
            Self::Media(index) => write!(f, "segment {index}"),
        }
    }
}

pub(crate) fn artifact_path(dir: &Path, item: WorkItem) -> PathBuf {
    match item {
        WorkItem::Init => dir.join("init.seg"),
        WorkItem::Media(index) => dir.join(format!("{index:08}.seg")),
    }
}

/// Tracker handle for a segment held in memory. Cleaned on drop, so a
/// worker future abandoned mid-segment does not leave it behind.
struct TrackedBuffer {
    resources: Arc<ResourceTracker>,
    id: ResourceId,
}

impl TrackedBuffer {
    fn register(resources: Arc<ResourceTracker>, label: String) -> Self {
        let id = resources.register(ResourceKind::Buffer, label);
        if let Err(e) = resources.touch(id) {
            debug!(id, error = %e, "Failed to activate buffer handle");
        }
        Self { resources, id }
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.resources.cleanup(self.id) {
            warn!(id = self.id, error = %e, "Failed to release buffer handle");
        }
    }
}

/// Where a work item comes from.
struct Source<'a> {
    url: &'a Url,
    range: Option<ByteRange>,
    encryption: &'a EncryptionDescriptor,
    media_sequence: u64,
}

/// Fetch, decrypt, validate and persist one work item.
///
/// A worker never retries. Any error goes back to the task runner, which
/// asks the retry coordinator what to do with it.
pub(crate) struct SegmentWorker {
    services: Arc<EngineServices>,
    stream: Arc<Stream>,
    keys: KeyCache,
    headers: HeaderMap,
    dir: PathBuf,
    dir_resource: ResourceId,
    task_id: TaskId,
    cancel: CancellationToken,
}

impl SegmentWorker {
    pub(crate) fn new(
        services: Arc<EngineServices>,
        stream: Arc<Stream>,
        headers: HeaderMap,
        dir: PathBuf,
        dir_resource: ResourceId,
        task_id: TaskId,
        cancel: CancellationToken,
    ) -> Self {
        let keys = KeyCache::new(Arc::clone(&services.fetcher), headers.clone());
        Self {
            services,
            stream,
            keys,
            headers,
            dir,
            dir_resource,
            task_id,
            cancel,
        }
    }

    /// Request kind and host a failure of `item` should be attributed to.
    pub(crate) fn failure_origin(&self, item: WorkItem, error: &DownloadError) -> (RequestKind, Option<String>) {
        let Ok(source) = self.source(item) else {
            return (RequestKind::Segment, None);
        };
        match error {
            DownloadError::Encryption {
                stage: EncryptionStage::KeyFetch,
                ..
            } => (
                RequestKind::Key,
                source.encryption.key_url.as_ref().and_then(|u| host_key(u).ok()),
            ),
            _ => (RequestKind::Segment, host_key(source.url).ok()),
        }
    }

    fn source(&self, item: WorkItem) -> Result<Source<'_>> {
        match item {
            WorkItem::Init => {
                let init = self.stream.init_section.as_ref().ok_or_else(|| {
                    DownloadError::resource("stream has no init section")
                })?;
                Ok(Source {
                    url: &init.url,
                    range: init.byte_range,
                    encryption: &init.encryption,
                    media_sequence: self
                        .stream
                        .segments
                        .first()
                        .map(|s| s.media_sequence)
                        .unwrap_or_default(),
                })
            }
            WorkItem::Media(index) => {
                let segment = usize::try_from(index)
                    .ok()
                    .and_then(|i| self.stream.segments.get(i))
                    .ok_or_else(|| {
                        DownloadError::resource(format!("segment {index} is out of range"))
                    })?;
                Ok(Source {
                    url: &segment.url,
                    range: segment.byte_range,
                    encryption: &segment.encryption,
                    media_sequence: segment.media_sequence,
                })
            }
        }
    }

    pub(crate) async fn run(&self, item: WorkItem) -> Result<SegmentArtifact> {
        let source = self.source(item)?;
        let body = self
            .services
            .fetcher
            .fetch(
                FetchRequest::new(source.url, RequestKind::Segment, &self.headers)
                    .with_range(source.range),
                &self.cancel,
            )
            .await?;
        self.services
            .validator
            .check_transfer(item.segment_index(), body.bytes.len(), source.range)?;

        let _buffer = TrackedBuffer::register(
            Arc::clone(&self.services.resources),
            format!("{} {item} ({} bytes)", self.task_id, body.bytes.len()),
        );
        self.finish(item, &source, body.bytes).await
    }

    async fn finish(&self, item: WorkItem, source: &Source<'_>, data: Bytes) -> Result<SegmentArtifact> {
        let key = match source.encryption.method {
            EncryptionMethod::Aes128 => {
                let key_url = source.encryption.key_url.as_ref().ok_or_else(|| {
                    DownloadError::encryption(EncryptionStage::KeyInvalid, "AES-128 key has no URI")
                })?;
                Some(self.keys.key_for(key_url, &self.cancel).await?)
            }
            _ => None,
        };
        let plain = self
            .services
            .decryptor
            .decrypt_segment(data, source.encryption, key, source.media_sequence)
            .await?;

        let validator = &self.services.validator;
        let report = match item {
            WorkItem::Init => match &self.stream.init_section {
                Some(init) => validator.validate_init(&plain, init),
                None => return Err(DownloadError::resource("stream has no init section")),
            },
            WorkItem::Media(index) => match usize::try_from(index)
                .ok()
                .and_then(|i| self.stream.segments.get(i))
            {
                Some(segment) => validator.validate(&plain, segment),
                None => {
                    return Err(DownloadError::resource(format!(
                        "segment {index} is out of range"
                    )));
                }
            },
        };
        report.into_result(item.segment_index())?;

        let path = self.write_artifact(item, &plain).await?;
        let resources = &self.services.resources;
        let file = resources.register_path(
            ResourceKind::TempFile,
            format!("{} {item}", self.task_id),
            path.clone(),
        );
        resources.add_dependent(self.dir_resource, file)?;
        // artifacts stay active until the run settles; idle handles get swept
        resources.touch(file)?;
        resources.touch(self.dir_resource)?;

        trace!(task_id = %self.task_id, %item, bytes = plain.len(), "Segment stored");
        Ok(SegmentArtifact {
            kind: item.artifact_kind(),
            path,
            len: plain.len() as u64,
        })
    }

    async fn write_artifact(&self, item: WorkItem, data: &[u8]) -> Result<PathBuf> {
        let path = artifact_path(&self.dir, item);
        let part = path.with_extension("seg.part");
        tokio::fs::write(&part, data)
            .await
            .map_err(|e| DownloadError::filesystem(&part, e))?;
        tokio::fs::rename(&part, &path)
            .await
            .map_err(|e| DownloadError::filesystem(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_sort_in_segment_order() {
        let dir = Path::new("/tmp/t");
        let a = artifact_path(dir, WorkItem::Media(9));
        let b = artifact_path(dir, WorkItem::Media(10));
        assert!(a < b);
        assert_eq!(artifact_path(dir, WorkItem::Init), dir.join("init.seg"));
    }

    #[test]
    fn work_items_map_to_artifacts() {
        assert_eq!(WorkItem::Init.artifact_kind(), ArtifactKind::Init);
        assert_eq!(WorkItem::Media(3).segment_index(), Some(3));
        assert_eq!(WorkItem::Init.to_string(), "init section");
    }

    #[test]
    fn buffer_handle_is_cleaned_when_dropped() {
        let resources = Arc::new(ResourceTracker::new(crate::config::ResourceConfig::default()));
        let buffer = TrackedBuffer::register(Arc::clone(&resources), "seg 0".to_string());
        assert_eq!(resources.stats().active, 1);
        drop(buffer);
        let stats = resources.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.leaked, 0);
        assert_eq!(stats.cleaned_total, 1);
        assert!(resources.snapshot().is_empty());
    }
}
