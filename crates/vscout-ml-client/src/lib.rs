//! Client for the external chunk analysis service.
//!
//! The analysis service takes one chunk artifact plus the entities already
//! known for the job and returns raw gameplay events. Calls are
//! asynchronous on the service side: a submission returns a task id that
//! is polled until it settles.
//!
//! [`AnalysisClient`] is the seam the pipeline depends on;
//! [`HttpAnalysisClient`] is the HTTP implementation.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AnalysisClient, AnalysisClientConfig, HttpAnalysisClient, TASK_DURATION_SECONDS};
pub use error::{MlError, MlResult};
pub use types::{AnalysisRequest, AnalysisResponse};
