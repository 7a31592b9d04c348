//! Progressive recovery: a per-task sidecar recording which segments are done.
//!
//! The bitmap is a scheduling hint only. On resume the orchestrator still
//! checks that each completed segment's artifact is on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, Result};
use crate::model::TaskId;

const FORMAT_VERSION: u32 = 1;

/// Fixed-size set of segment indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionBitmap {
    len: u64,
    words: Vec<u64>,
}

impl CompletionBitmap {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(64) as usize],
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.len && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Returns `true` when the bit was newly set.
    fn insert(&mut self, index: u64) -> bool {
        let word = &mut self.words[(index / 64) as usize];
        let mask = 1 << (index % 64);
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(|&i| self.contains(i))
    }

    /// A well-formed bitmap has exactly enough words and no bits past `len`.
    fn is_consistent(&self) -> bool {
        if self.words.len() as u64 != self.len.div_ceil(64) {
            return false;
        }
        match (self.len % 64, self.words.last()) {
            (0, _) | (_, None) => true,
            (tail, Some(last)) => last >> tail == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub version: u32,
    pub task_id: TaskId,
    pub total_segments: u64,
    pub completed: CompletionBitmap,
    pub playlist_checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoverySession {
    fn new(task_id: &str, total_segments: u64, playlist_checksum: &str) -> Self {
        let now = Utc::now();
        Self {
            version: FORMAT_VERSION,
            task_id: task_id.to_string(),
            total_segments,
            completed: CompletionBitmap::new(total_segments),
            playlist_checksum: playlist_checksum.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self, index: u64) -> bool {
        self.completed.contains(index)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.count()
    }

    fn matches(&self, total_segments: u64, playlist_checksum: &str) -> bool {
        self.total_segments == total_segments && self.playlist_checksum == playlist_checksum
    }
}

/// JSON sidecars under one directory, one per task.
pub struct RecoveryStore {
    dir: PathBuf,
    sessions: DashMap<TaskId, Arc<Mutex<RecoverySession>>>,
}

impl RecoveryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", storage_key(task_id)))
    }

    /// The persisted session for `task_id`, if one exists and is readable.
    /// Corrupt sidecars are logged and treated as absent.
    pub async fn load(&self, task_id: &str) -> Result<Option<RecoverySession>> {
        if let Some(session) = self.sessions.get(task_id).map(|s| Arc::clone(s.value())) {
            return Ok(Some(session.lock().await.clone()));
        }

        let path = self.path_for(task_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DownloadError::filesystem(path, e)),
        };

        match serde_json::from_str::<RecoverySession>(&json) {
            Ok(session)
                if session.version == FORMAT_VERSION
                    && session.task_id == task_id
                    && session.completed.len() == session.total_segments
                    && session.completed.is_consistent() =>
            {
                Ok(Some(session))
            }
            Ok(_) => {
                warn!(task_id, path = %path.display(), "Ignoring inconsistent recovery state");
                Ok(None)
            }
            Err(e) => {
                warn!(task_id, path = %path.display(), error = %e, "Ignoring corrupt recovery state");
                Ok(None)
            }
        }
    }

    /// Open the session for a run. An existing session is reused when it
    /// describes the same playlist; otherwise a fresh one replaces it.
    /// Returns the session and whether it was resumed.
    pub async fn begin(
        &self,
        task_id: &str,
        total_segments: u64,
        playlist_checksum: &str,
    ) -> Result<(RecoverySession, bool)> {
        if let Some(existing) = self.load(task_id).await? {
            if existing.matches(total_segments, playlist_checksum) {
                info!(
                    task_id,
                    completed = existing.completed_count(),
                    total = total_segments,
                    "Resuming from recovery state"
                );
                self.sessions.insert(
                    task_id.to_string(),
                    Arc::new(Mutex::new(existing.clone())),
                );
                return Ok((existing, true));
            }
            info!(task_id, "Recovery state is stale, starting over");
        }

        let session = RecoverySession::new(task_id, total_segments, playlist_checksum);
        self.persist(&session).await?;
        self.sessions
            .insert(task_id.to_string(), Arc::new(Mutex::new(session.clone())));
        Ok((session, false))
    }

    /// Record one completed segment and persist. Idempotent.
    pub async fn mark_complete(&self, task_id: &str, segment_index: u64) -> Result<()> {
        let session = self
            .sessions
            .get(task_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                DownloadError::resource(format!("no recovery session open for task {task_id}"))
            })?;

        let mut session = session.lock().await;
        if segment_index >= session.total_segments {
            return Err(DownloadError::resource(format!(
                "segment {segment_index} out of range for {} segments",
                session.total_segments
            )));
        }
        if !session.completed.insert(segment_index) {
            return Ok(());
        }
        session.updated_at = Utc::now();
        self.persist(&session).await?;
        debug!(task_id, segment = segment_index, "Recovery state updated");
        Ok(())
    }

    /// Drop the in-memory handle, keeping the sidecar on disk.
    pub fn close(&self, task_id: &str) {
        self.sessions.remove(task_id);
    }

    /// Delete the session, in memory and on disk.
    pub async fn finalize(&self, task_id: &str) -> Result<()> {
        self.sessions.remove(task_id);
        let path = self.path_for(task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(task_id, "Recovery state removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::filesystem(path, e)),
        }
    }

    async fn persist(&self, session: &RecoverySession) -> Result<()> {
        let json = serde_json::to_vec(session)
            .map_err(|e| DownloadError::resource(format!("failed to encode recovery state: {e}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DownloadError::filesystem(&self.dir, e))?;

        let path = self.path_for(&session.task_id);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| DownloadError::filesystem(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| DownloadError::filesystem(&path, e))
    }
}

/// File-system safe name for a task id. Ids that need escaping get a hash
/// suffix so distinct ids never share a file.
pub(crate) fn storage_key(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if safe == task_id && !safe.is_empty() {
        safe
    } else {
        let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
        format!("{safe}-{}", &digest[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_membership() {
        let mut bitmap = CompletionBitmap::new(130);
        assert!(bitmap.insert(0));
        assert!(bitmap.insert(64));
        assert!(bitmap.insert(129));
        assert!(!bitmap.insert(64));
        assert_eq!(bitmap.count(), 3);
        assert!(bitmap.contains(129));
        assert!(!bitmap.contains(130));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 64, 129]);
        assert!(bitmap.is_consistent());
    }

    #[test]
    fn storage_keys_are_safe_and_distinct() {
        assert_eq!(storage_key("task-01_a"), "task-01_a");
        let a = storage_key("../etc/passwd");
        let b = storage_key("__etc_passwd");
        assert!(!a.contains('/'));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn begin_mark_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path());

        let (session, resumed) = store.begin("t1", 10, "abc").await.unwrap();
        assert!(!resumed);
        assert_eq!(session.completed_count(), 0);

        store.mark_complete("t1", 0).await.unwrap();
        store.mark_complete("t1", 3).await.unwrap();
        store.mark_complete("t1", 3).await.unwrap();

        // a fresh store sees what was persisted
        let reopened = RecoveryStore::new(dir.path());
        let loaded = reopened.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.completed.iter().collect::<Vec<_>>(), vec![0, 3]);

        let (session, resumed) = reopened.begin("t1", 10, "abc").await.unwrap();
        assert!(resumed);
        assert!(session.is_complete(3));
    }

    #[tokio::test]
    async fn changed_playlist_replaces_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path());
        store.begin("t1", 10, "abc").await.unwrap();
        store.mark_complete("t1", 5).await.unwrap();
        store.close("t1");

        let (session, resumed) = store.begin("t1", 10, "changed").await.unwrap();
        assert!(!resumed);
        assert_eq!(session.completed_count(), 0);
    }

    #[tokio::test]
    async fn out_of_range_and_unknown_tasks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path());
        store.begin("t1", 2, "abc").await.unwrap();
        assert!(store.mark_complete("t1", 2).await.is_err());
        assert!(store.mark_complete("nope", 0).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_sidecar_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path());
        std::fs::write(dir.path().join("t1.json"), b"{ not json").unwrap();
        assert!(store.load("t1").await.unwrap().is_none());
        let (_, resumed) = store.begin("t1", 4, "abc").await.unwrap();
        assert!(!resumed);
    }

    #[tokio::test]
    async fn finalize_removes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path());
        store.begin("t1", 2, "abc").await.unwrap();
        assert!(dir.path().join("t1.json").exists());
        store.finalize("t1").await.unwrap();
        assert!(!dir.path().join("t1.json").exists());
        assert!(store.load("t1").await.unwrap().is_none());
        // finalizing twice is fine
        store.finalize("t1").await.unwrap();
    }
}
