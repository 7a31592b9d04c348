use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{DownloadError, Result};

const WRITE_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Init,
    Media(u64),
}

impl ArtifactKind {
    fn order_key(&self) -> (u8, u64) {
        match self {
            Self::Init => (0, 0),
            Self::Media(index) => (1, *index),
        }
    }
}

impl PartialOrd for ArtifactKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArtifactKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// A validated, decrypted segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Length recorded when the artifact was written.
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output: PathBuf,
    pub artifacts: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Streams artifacts into the output in segment order.
///
/// The output is assembled at `<output>.part` and renamed into place only
/// after the byte count checks out, so a failed merge never leaves a
/// truncated file at the final path. Sources are never deleted here.
#[derive(Debug, Default, Clone)]
pub struct Merger;

impl Merger {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, artifacts), fields(output = %output.display(), count = artifacts.len()))]
    pub async fn merge(&self, artifacts: &[SegmentArtifact], output: &Path) -> Result<MergeReport> {
        let started = Instant::now();
        let mut ordered: Vec<&SegmentArtifact> = artifacts.iter().collect();
        ordered.sort_by_key(|a| a.kind);
        if let Some(pair) = ordered.windows(2).find(|w| w[0].kind == w[1].kind) {
            return Err(DownloadError::Merge {
                reason: format!("duplicate artifact {:?}", pair[0].kind),
                expected_bytes: 0,
                actual_bytes: 0,
            });
        }
        let expected: u64 = ordered.iter().map(|a| a.len).sum();

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::filesystem(parent, e))?;
        }

        let part = part_path(output);
        let written = match write_all(&ordered, &part).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if written != expected {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(DownloadError::Merge {
                reason: "merged size differs from the sum of segment sizes".to_string(),
                expected_bytes: expected,
                actual_bytes: written,
            });
        }

        tokio::fs::rename(&part, output)
            .await
            .map_err(|e| DownloadError::filesystem(output, e))?;

        let report = MergeReport {
            output: output.to_path_buf(),
            artifacts: ordered.len(),
            bytes_written: written,
            elapsed: started.elapsed(),
        };
        info!(
            bytes = report.bytes_written,
            artifacts = report.artifacts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Merged output"
        );
        Ok(report)
    }
}

async fn write_all(ordered: &[&SegmentArtifact], part: &Path) -> Result<u64> {
    let file = File::create(part)
        .await
        .map_err(|e| DownloadError::filesystem(part, e))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
    let mut written = 0u64;

    for artifact in ordered {
        let mut source = File::open(&artifact.path)
            .await
            .map_err(|e| DownloadError::filesystem(&artifact.path, e))?;
        let copied = tokio::io::copy(&mut source, &mut writer)
            .await
            .map_err(|e| DownloadError::filesystem(&artifact.path, e))?;
        if copied != artifact.len {
            debug!(
                artifact = %artifact.path.display(),
                recorded = artifact.len,
                copied,
                "Artifact size changed on disk"
            );
        }
        written += copied;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::filesystem(part, e))?;
    let file = writer.into_inner();
    file.sync_all()
        .await
        .map_err(|e| DownloadError::filesystem(part, e))?;
    Ok(written)
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn artifact(dir: &Path, kind: ArtifactKind, body: &[u8]) -> SegmentArtifact {
        let name = match kind {
            ArtifactKind::Init => "init.seg".to_string(),
            ArtifactKind::Media(i) => format!("{i:08}.seg"),
        };
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        SegmentArtifact {
            kind,
            path,
            len: body.len() as u64,
        }
    }

    #[tokio::test]
    async fn merges_in_index_order_with_init_first() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![
            artifact(dir.path(), ArtifactKind::Media(2), b"cc").await,
            artifact(dir.path(), ArtifactKind::Media(0), b"a").await,
            artifact(dir.path(), ArtifactKind::Init, b"II").await,
            artifact(dir.path(), ArtifactKind::Media(1), b"bbb").await,
        ];
        let output = dir.path().join("out/video.ts");

        let report = Merger::new().merge(&artifacts, &output).await.unwrap();
        assert_eq!(report.bytes_written, 8);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"IIabbbcc");
        assert!(!part_path(&output).exists());
        // sources stay for the caller to clean
        assert!(artifacts.iter().all(|a| a.path.exists()));
    }

    #[tokio::test]
    async fn size_mismatch_fails_and_keeps_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = vec![
            artifact(dir.path(), ArtifactKind::Media(0), b"aaaa").await,
            artifact(dir.path(), ArtifactKind::Media(1), b"bbbb").await,
        ];
        // truncated on disk after being recorded
        tokio::fs::write(&artifacts[1].path, b"bb").await.unwrap();
        artifacts[1].len = 4;
        let output = dir.path().join("video.ts");

        let err = Merger::new().merge(&artifacts, &output).await.unwrap_err();
        match err {
            DownloadError::Merge {
                expected_bytes,
                actual_bytes,
                ..
            } => {
                assert_eq!(expected_bytes, 8);
                assert_eq!(actual_bytes, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
        assert!(artifacts.iter().all(|a| a.path.exists()));
    }

    #[tokio::test]
    async fn missing_source_is_a_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![SegmentArtifact {
            kind: ArtifactKind::Media(0),
            path: dir.path().join("missing.seg"),
            len: 1,
        }];
        let err = Merger::new()
            .merge(&artifacts, &dir.path().join("video.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Filesystem { .. }));
    }

    #[tokio::test]
    async fn duplicate_indices_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifact(dir.path(), ArtifactKind::Media(0), b"a").await;
        let err = Merger::new()
            .merge(&[a.clone(), a], &dir.path().join("video.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Merge { .. }));
    }
}
