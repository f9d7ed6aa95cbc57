//! Chunk planning.
//!
//! Planning is a pure function of the video duration and the chunk
//! geometry, so every orchestration pass over the same job produces the
//! same sequence numbers, start times and durations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from chunk planning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("Video duration must be positive, got {0}")]
    InvalidDuration(f64),

    #[error("Chunk length ({chunk_len}s) must exceed overlap ({overlap}s)")]
    InvalidGeometry { chunk_len: f64, overlap: f64 },
}

/// A chunk window produced by [`plan_chunks`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub sequence: u32,
    pub start_secs: f64,
    pub duration_secs: f64,
    /// Tail window shorter than the overlap; already covered by its
    /// predecessor and completed without analysis.
    pub negligible: bool,
}

/// Plan overlapping windows over a video.
///
/// `count = ceil((duration > overlap ? duration - overlap : duration) / (chunk_len - overlap))`,
/// window `i` starts at `i * (chunk_len - overlap)` and lasts
/// `min(chunk_len, duration - start)`.
///
/// # Examples
/// ```
/// use vscout_models::planning::plan_chunks;
/// let plan = plan_chunks(310.0, 150.0, 30.0).unwrap();
/// let starts: Vec<f64> = plan.iter().map(|c| c.start_secs).collect();
/// assert_eq!(starts, vec![0.0, 120.0, 240.0]);
/// ```
pub fn plan_chunks(duration: f64, chunk_len: f64, overlap: f64) -> Result<Vec<PlannedChunk>, PlanningError> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(PlanningError::InvalidDuration(duration));
    }
    if overlap < 0.0 || chunk_len <= overlap {
        return Err(PlanningError::InvalidGeometry { chunk_len, overlap });
    }

    let stride = chunk_len - overlap;
    let span = if duration > overlap { duration - overlap } else { duration };
    let count = (span / stride).ceil().max(1.0) as u32;

    let plan = (0..count)
        .map(|sequence| {
            let start_secs = sequence as f64 * stride;
            let remaining = (duration - start_secs).max(0.0);
            PlannedChunk {
                sequence,
                start_secs,
                duration_secs: remaining.min(chunk_len),
                negligible: sequence > 0 && remaining < overlap,
            }
        })
        .collect();

    Ok(plan)
}
