//! Chunk splitting.
//!
//! The orchestration layer only needs three things from media handling:
//! the source duration, one materialized segment per chunk, and a way to
//! delete segments once a job is finished. [`ChunkSplitter`] is that seam.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use vscout_models::JobId;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::get_duration;

/// One segment to materialize.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitRequest {
    pub job_id: JobId,
    pub source_path: String,
    pub sequence: u32,
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// Produces playable sub-files for chunk windows.
#[async_trait]
pub trait ChunkSplitter: Send + Sync {
    /// Duration of the source video in seconds.
    async fn probe_duration(&self, source_path: &str) -> MediaResult<f64>;

    /// Materialize one segment and return its path.
    async fn split(&self, request: &SplitRequest) -> MediaResult<PathBuf>;

    /// Delete a materialized segment. Missing files are not an error.
    async fn remove_artifact(&self, artifact_path: &str) -> MediaResult<()> {
        match fs::remove_file(artifact_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MediaError::Io(e)),
        }
    }
}

/// FFmpeg-backed splitter writing `{work_dir}/{job_id}/chunk_{seq:05}.mp4`.
#[derive(Debug, Clone)]
pub struct FfmpegChunkSplitter {
    work_dir: PathBuf,
    runner: FfmpegRunner,
}

impl FfmpegChunkSplitter {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runner: FfmpegRunner::new(),
        }
    }

    /// Kill FFmpeg invocations that run longer than `secs`.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.runner = self.runner.with_timeout(secs);
        self
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.runner.timeout_secs()
    }

    /// Where the segment for `sequence` of `job_id` is written.
    pub fn artifact_path(&self, job_id: &JobId, sequence: u32) -> PathBuf {
        self.work_dir
            .join(job_id.as_str())
            .join(format!("chunk_{:05}.mp4", sequence))
    }
}

#[async_trait]
impl ChunkSplitter for FfmpegChunkSplitter {
    async fn probe_duration(&self, source_path: &str) -> MediaResult<f64> {
        get_duration(source_path).await
    }

    async fn split(&self, request: &SplitRequest) -> MediaResult<PathBuf> {
        let output = self.artifact_path(&request.job_id, request.sequence);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!(
            job_id = %request.job_id,
            sequence = request.sequence,
            "Extracting segment: {} -> {} (start: {:.2}s, duration: {:.2}s)",
            request.source_path,
            output.display(),
            request.start_secs,
            request.duration_secs
        );

        let cmd = FfmpegCommand::new(Path::new(&request.source_path), &output)
            .seek(request.start_secs)
            .duration(request.duration_secs)
            .codec_copy()
            .reset_timestamps();

        self.runner.run(&cmd).await?;

        debug!("Segment extracted: {}", output.display());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_layout() {
        let splitter = FfmpegChunkSplitter::new("/tmp/vscout");
        let path = splitter.artifact_path(&JobId::from_string("job_abc"), 3);
        assert_eq!(path, PathBuf::from("/tmp/vscout/job_abc/chunk_00003.mp4"));
    }

    #[test]
    fn test_timeout_is_carried_to_runner() {
        assert_eq!(FfmpegChunkSplitter::new("/tmp/vscout").timeout_secs(), None);
        let bounded = FfmpegChunkSplitter::new("/tmp/vscout").with_timeout(90);
        assert_eq!(bounded.timeout_secs(), Some(90));
    }

    #[tokio::test]
    async fn test_remove_artifact_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chunk_00000.mp4");
        tokio::fs::write(&file, b"data").await.unwrap();

        let splitter = FfmpegChunkSplitter::new(dir.path());
        let path = file.to_string_lossy().to_string();
        splitter.remove_artifact(&path).await.unwrap();
        assert!(!file.exists());

        // Second removal of a missing file succeeds
        splitter.remove_artifact(&path).await.unwrap();
    }
}
