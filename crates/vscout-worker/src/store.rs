//! Persistence seam for jobs, chunks, events and entities.
//!
//! Every status change goes through a compare-and-set: the write only lands
//! if the stored status is still the one the caller observed. Losing a race
//! is reported as `Ok(false)`, never as an error.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use vscout_models::{Chunk, ChunkId, ChunkStatus, IdentifiedEntity, Job, JobId, JobStatus, ProcessedEvent};

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. Returns `false` if one with the same id exists.
    async fn create_job(&self, job: &Job) -> StoreResult<bool>;

    async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>>;

    /// Write `job` if its stored status is one of `expected`. Fails with
    /// [`StoreError::IllegalTransition`] when the stored status may not move
    /// to `job.status`.
    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> StoreResult<bool>;

    async fn touch_job_heartbeat(&self, job_id: &JobId) -> StoreResult<()>;

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>>;

    /// Insert a chunk. Returns `false` if (job, sequence) exists.
    async fn create_chunk(&self, chunk: &Chunk) -> StoreResult<bool>;

    async fn get_chunk(&self, chunk_id: &ChunkId) -> StoreResult<Option<Chunk>>;

    /// Write `chunk` if its stored status is `expected`.
    async fn transition_chunk(&self, chunk: &Chunk, expected: ChunkStatus) -> StoreResult<bool>;

    /// Chunks of a job ordered by sequence.
    async fn list_chunks(&self, job_id: &JobId) -> StoreResult<Vec<Chunk>>;

    /// Chunks of stage `sequence` in `status`, across all jobs.
    async fn list_stage(&self, sequence: u32, status: ChunkStatus) -> StoreResult<Vec<Chunk>>;

    /// Insert events whose id is not yet stored. Returns how many were new.
    async fn append_events(&self, job_id: &JobId, events: &[ProcessedEvent]) -> StoreResult<usize>;

    /// Accepted events ordered by absolute timestamp.
    async fn list_events(&self, job_id: &JobId) -> StoreResult<Vec<ProcessedEvent>>;

    /// Insert entities whose id is not yet stored.
    async fn insert_entities(&self, job_id: &JobId, entities: &[IdentifiedEntity]) -> StoreResult<usize>;

    async fn list_entities(&self, job_id: &JobId) -> StoreResult<Vec<IdentifiedEntity>>;
}

/// Reject a job write whose status change is not a legal edge.
pub fn check_job_transition(job: &Job, stored: JobStatus) -> StoreResult<()> {
    if stored != job.status && !stored.can_transition_to(job.status) {
        return Err(StoreError::illegal_transition(&job.id, stored, job.status));
    }
    Ok(())
}

/// Reject a chunk write whose status change is not a legal edge.
pub fn check_chunk_transition(chunk: &Chunk, expected: ChunkStatus) -> StoreResult<()> {
    if !expected.can_transition_to(chunk.status) {
        return Err(StoreError::illegal_transition(&chunk.id, expected, chunk.status));
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    chunks: BTreeMap<ChunkId, Chunk>,
    events: HashMap<JobId, BTreeMap<String, ProcessedEvent>>,
    entities: HashMap<JobId, BTreeMap<String, IdentifiedEntity>>,
}

/// In-process store for tests and single-node local runs.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a job without any checks (test setup).
    pub async fn put_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id.clone(), job);
    }

    /// Overwrite a chunk without any checks (test setup).
    pub async fn put_chunk(&self, chunk: Chunk) {
        self.state.write().await.chunks.insert(chunk.id.clone(), chunk);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Ok(false);
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(job_id).cloned())
    }

    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.to_string()))?;
        if !expected.contains(&stored.status) {
            return Ok(false);
        }
        check_job_transition(job, stored.status)?;
        *stored = job.clone();
        Ok(true)
    }

    async fn touch_job_heartbeat(&self, job_id: &JobId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        job.record_heartbeat();
        Ok(())
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn create_chunk(&self, chunk: &Chunk) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.chunks.contains_key(&chunk.id) {
            return Ok(false);
        }
        state.chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(true)
    }

    async fn get_chunk(&self, chunk_id: &ChunkId) -> StoreResult<Option<Chunk>> {
        Ok(self.state.read().await.chunks.get(chunk_id).cloned())
    }

    async fn transition_chunk(&self, chunk: &Chunk, expected: ChunkStatus) -> StoreResult<bool> {
        check_chunk_transition(chunk, expected)?;
        let mut state = self.state.write().await;
        let stored = state
            .chunks
            .get_mut(&chunk.id)
            .ok_or_else(|| StoreError::NotFound(chunk.id.to_string()))?;
        if stored.status != expected {
            return Ok(false);
        }
        let now = Utc::now();
        *stored = chunk.clone();
        stored.updated_at = now;
        // Stage rank is by claim order, so the claim is stamped at commit.
        if chunk.status == ChunkStatus::Analyzing {
            stored.analysis_started_at = Some(now);
        }
        Ok(true)
    }

    async fn list_chunks(&self, job_id: &JobId) -> StoreResult<Vec<Chunk>> {
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| &c.job_id == job_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence);
        Ok(chunks)
    }

    async fn list_stage(&self, sequence: u32, status: ChunkStatus) -> StoreResult<Vec<Chunk>> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .values()
            .filter(|c| c.sequence == sequence && c.status == status)
            .cloned()
            .collect())
    }

    async fn append_events(&self, job_id: &JobId, events: &[ProcessedEvent]) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let stored = state.events.entry(job_id.clone()).or_default();
        let mut written = 0;
        for event in events {
            if !stored.contains_key(&event.id) {
                stored.insert(event.id.clone(), event.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn list_events(&self, job_id: &JobId) -> StoreResult<Vec<ProcessedEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<ProcessedEvent> = state
            .events
            .get(job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        vscout_models::sort_by_timeline(&mut events);
        Ok(events)
    }

    async fn insert_entities(&self, job_id: &JobId, entities: &[IdentifiedEntity]) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let stored = state.entities.entry(job_id.clone()).or_default();
        let mut written = 0;
        for entity in entities {
            if !stored.contains_key(&entity.id) {
                stored.insert(entity.id.clone(), entity.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn list_entities(&self, job_id: &JobId) -> StoreResult<Vec<IdentifiedEntity>> {
        let state = self.state.read().await;
        Ok(state
            .entities
            .get(job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vscout_models::VideoId;

    fn job() -> Job {
        Job::new(VideoId::from("v1"), "/videos/v1.mp4", "user-1")
    }

    #[tokio::test]
    async fn test_create_job_is_unique() {
        let store = MemoryJobStore::new();
        let job = job();
        assert!(store.create_job(&job).await.unwrap());
        assert!(!store.create_job(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_job_cas_only_from_expected() {
        let store = MemoryJobStore::new();
        let mut job = job();
        store.create_job(&job).await.unwrap();

        job.set_status(JobStatus::Processing);
        assert!(store.transition_job(&job, &[JobStatus::Pending]).await.unwrap());

        job.set_status(JobStatus::Completed);
        assert!(!store.transition_job(&job, &[JobStatus::Pending]).await.unwrap());
        assert!(store.transition_job(&job, &[JobStatus::Processing]).await.unwrap());

        job.set_status(JobStatus::Failed);
        let err = store
            .transition_job(&job, &[JobStatus::Completed])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_chunk_cas_and_illegal_edges() {
        let store = MemoryJobStore::new();
        let mut chunk = Chunk::new(JobId::from_string("job_1"), 0, 0.0, 150.0);
        assert!(store.create_chunk(&chunk).await.unwrap());
        assert!(!store.create_chunk(&chunk).await.unwrap());

        chunk.set_status(ChunkStatus::Analyzing);
        let err = store
            .transition_chunk(&chunk, ChunkStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        chunk.set_status(ChunkStatus::Chunking);
        assert!(store.transition_chunk(&chunk, ChunkStatus::Pending).await.unwrap());
        // a second writer that also observed Pending loses
        assert!(!store.transition_chunk(&chunk, ChunkStatus::Pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_listing_spans_jobs() {
        let store = MemoryJobStore::new();
        for job in ["job_a", "job_b"] {
            let mut chunk = Chunk::new(JobId::from_string(job), 1, 120.0, 150.0);
            chunk.set_status(ChunkStatus::Analyzing);
            store.put_chunk(chunk).await;
        }
        store
            .put_chunk(Chunk::new(JobId::from_string("job_c"), 1, 120.0, 150.0))
            .await;

        let stage = store.list_stage(1, ChunkStatus::Analyzing).await.unwrap();
        assert_eq!(stage.len(), 2);
        assert!(store.list_stage(0, ChunkStatus::Analyzing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_requires_job() {
        let store = MemoryJobStore::new();
        let job = job();
        assert!(store.touch_job_heartbeat(&job.id).await.is_err());
        store.create_job(&job).await.unwrap();
        store.touch_job_heartbeat(&job.id).await.unwrap();
        assert!(store.get_job(&job.id).await.unwrap().unwrap().last_heartbeat.is_some());
    }
}
