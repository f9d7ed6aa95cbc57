//! FFmpeg CLI wrapper for chunking source videos.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Timeout-bounded command execution with stderr capture
//! - FFprobe duration probing
//! - The [`ChunkSplitter`] seam and its FFmpeg implementation

pub mod command;
pub mod error;
pub mod probe;
pub mod splitter;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{get_duration, probe_video, VideoInfo};
pub use splitter::{ChunkSplitter, FfmpegChunkSplitter, SplitRequest};
