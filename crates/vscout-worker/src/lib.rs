//! Chunked video analysis pipeline.
//!
//! This crate provides:
//! - The job/chunk store seam with Firestore and in-memory backends
//! - Orchestration: job intake, resumption and chunk planning
//! - Chunk analysis with sequential and per-stage parallel gating
//! - Cross-chunk event deduplication and entity identity
//! - Finalization and the stale-job reconciler
//! - The Redis Streams executor with heartbeats and graceful shutdown

pub mod chunk_worker;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod finalizer;
pub mod firestore_store;
pub mod heartbeat;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod store;

#[cfg(test)]
mod test_support;

pub use chunk_worker::{ChunkWorker, Disposition};
pub use config::{StoreBackend, WorkerConfig};
pub use context::PipelineContext;
pub use error::{StoreError, StoreResult, WorkerError, WorkerResult};
pub use events::{process_events, ChunkWindow, EventInput, ProcessedBatch};
pub use executor::PipelineExecutor;
pub use finalizer::{FinalizeOutcome, Finalizer};
pub use firestore_store::FirestoreJobStore;
pub use logging::{init_tracing, JobLogger};
pub use metrics::init_metrics;
pub use orchestrator::{Orchestrator, PlanReport, SubmitOutcome};
pub use reconciler::{ReconcileReport, Reconciler};
pub use store::{JobStore, MemoryJobStore};
