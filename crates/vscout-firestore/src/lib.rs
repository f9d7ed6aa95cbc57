//! Firestore REST API client.
//!
//! This crate provides:
//! - Typed repositories for analysis jobs, chunks, events and entities
//! - Service account authentication via gcp_auth
//! - Create-if-absent, precondition updates, structured queries and
//!   non-atomic batch writes
//! - Retry with backoff and request metrics

pub mod chunk_repo;
pub mod client;
pub mod error;
pub mod event_repo;
pub mod fields;
pub mod job_repo;
pub mod metrics;
pub mod retry;
pub mod token_cache;
pub mod types;


pub use chunk_repo::ChunkRepository;
pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use event_repo::EventRepository;
pub use job_repo::JobRepository;
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};

/// Top-level collection holding one document per job.
pub const JOBS_COLLECTION: &str = "analysis_jobs";

/// Top-level collection holding every chunk, so stage queries span jobs.
pub const CHUNKS_COLLECTION: &str = "analysis_chunks";

/// Per-job subcollection of accepted events, keyed by event id.
pub const EVENTS_SUBCOLLECTION: &str = "events";

/// Per-job subcollection of identified entities, keyed by entity id.
pub const ENTITIES_SUBCOLLECTION: &str = "entities";

/// Versioned read: the decoded value plus the document's update time, used
/// as a precondition on the next write.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub update_time: Option<String>,
}
