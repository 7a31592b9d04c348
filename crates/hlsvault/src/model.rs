//! Core data model: streams, segments, encryption descriptors and tasks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DownloadError, FailureReport, Result};

pub type TaskId = String;

/// Absolute byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        let end = self.offset + self.length.saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Aes128,
    SampleAes,
    Unknown(String),
}

/// Encryption parameters shared by every segment that uses the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub method: EncryptionMethod,
    pub key_url: Option<Url>,
    /// Explicit IV. When absent the segment's media sequence number is used.
    pub iv: Option<[u8; 16]>,
}

impl EncryptionDescriptor {
    pub fn none() -> Self {
        Self {
            method: EncryptionMethod::None,
            key_url: None,
            iv: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.method != EncryptionMethod::None
    }

    pub fn iv_for(&self, media_sequence: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| default_iv(media_sequence))
    }
}

/// Big-endian 16-byte encoding of a media sequence number.
pub fn default_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position in the stream, contiguous from zero.
    pub sequence_index: u64,
    /// `EXT-X-MEDIA-SEQUENCE` base plus position.
    pub media_sequence: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub duration: f64,
    pub encryption: Arc<EncryptionDescriptor>,
}

/// fMP4 initialisation section declared by `EXT-X-MAP`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSection {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub encryption: Arc<EncryptionDescriptor>,
}

/// One selectable quality variant. Variants listed by a master playlist have
/// no segments until their media playlist is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub url: Url,
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub codecs: Option<String>,
    pub segments: Vec<Segment>,
    pub encryption: Arc<EncryptionDescriptor>,
    pub init_section: Option<InitSection>,
    pub target_duration: f64,
    /// No `EXT-X-ENDLIST`: the segment list is a snapshot.
    pub is_live: bool,
}

impl Stream {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Unit of work owned by the orchestrator. Collaborators only ever see clones.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub task_id: TaskId,
    pub name: String,
    pub source_url: Url,
    pub source_stream: Option<Arc<Stream>>,
    pub output_path: PathBuf,
    pub priority: Priority,
    pub headers: Vec<(String, String)>,
    pub status: TaskStatus,
    pub total_segments: u64,
    pub completed_segment_count: u64,
    pub failed_segment_count: u64,
    pub bytes_downloaded: u64,
    pub last_error: Option<FailureReport>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(
        task_id: TaskId,
        name: String,
        source_url: Url,
        output_path: PathBuf,
        priority: Priority,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            task_id,
            name,
            source_url,
            source_stream: None,
            output_path,
            priority,
            headers,
            status: TaskStatus::Pending,
            total_segments: 0,
            completed_segment_count: 0,
            failed_segment_count: 0,
            bytes_downloaded: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a status change, returning the previous status.
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition { from, to: next });
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.finished_at = Some(Utc::now())
            }
            TaskStatus::Pending => {
                self.finished_at = None;
                self.last_error = None;
            }
            TaskStatus::Paused => {}
        }
        Ok(from)
    }
}
