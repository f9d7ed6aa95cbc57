//! Errors from probing and splitting source videos.

use std::path::PathBuf;
use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Source not found: {0}")]
    FileNotFound(PathBuf),

    #[error("FFmpeg timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unreadable ffprobe output: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unusable source video: {0}")]
    InvalidVideo(String),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Missing binaries and unreadable sources are not retryable; process
    /// failures and timeouts are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediaError::FfmpegFailed { .. }
                | MediaError::FfprobeFailed { .. }
                | MediaError::Timeout(_)
                | MediaError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MediaError::Timeout(30).is_retryable());
        assert!(MediaError::ffmpeg_failed("exit 1", None, Some(1)).is_retryable());
        assert!(!MediaError::FfmpegNotFound.is_retryable());
        assert!(!MediaError::InvalidVideo("no video stream".into()).is_retryable());
    }
}
