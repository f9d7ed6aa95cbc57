//! Processing mode selection.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How chunks of a job are scheduled against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Chunk N is analysed only after chunk N-1 completed; one job at a
    /// time per worker. Continuation tokens flow between chunks.
    Sequential,
    /// Chunks run concurrently, bounded per stage across all jobs.
    #[default]
    Parallel,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Sequential => "sequential",
            ProcessingMode::Parallel => "parallel",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown processing mode '{0}', expected 'sequential' or 'parallel'")]
pub struct UnknownProcessingMode(pub String);

impl FromStr for ProcessingMode {
    type Err = UnknownProcessingMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ProcessingMode::Sequential),
            "parallel" => Ok(ProcessingMode::Parallel),
            other => Err(UnknownProcessingMode(other.to_string())),
        }
    }
}
