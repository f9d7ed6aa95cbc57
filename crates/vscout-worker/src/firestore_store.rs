//! [`JobStore`] backed by Firestore.
//!
//! Compare-and-set is a read followed by a write guarded by the read's
//! `updateTime`. The guarded value is the status only: when the document
//! changed underneath (a heartbeat touch, say) the status is re-checked and
//! the write retried, so a lost race is reported only when the status
//! itself moved.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use vscout_firestore::{
    ChunkRepository, EventRepository, FirestoreClient, FirestoreError, JobRepository,
};
use vscout_models::{Chunk, ChunkId, ChunkStatus, IdentifiedEntity, Job, JobId, JobStatus, ProcessedEvent};

use crate::error::{StoreError, StoreResult};
use crate::store::{check_chunk_transition, check_job_transition, JobStore};

/// Read-check-write rounds before a contended write gives up.
const CAS_ATTEMPTS: u32 = 5;

pub struct FirestoreJobStore {
    jobs: JobRepository,
    chunks: ChunkRepository,
    events: EventRepository,
}

impl FirestoreJobStore {
    pub fn new(client: FirestoreClient) -> Self {
        Self {
            jobs: JobRepository::new(client.clone()),
            chunks: ChunkRepository::new(client.clone()),
            events: EventRepository::new(client),
        }
    }
}

/// Map a guarded write's result onto "landed" / "document changed".
fn cas_outcome<T>(result: Result<T, FirestoreError>, id: &str) -> StoreResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_precondition_failed() => {
            debug!(id = %id, "Document changed since read; re-checking status");
            Ok(false)
        }
        Err(FirestoreError::NotFound(_)) => Err(StoreError::NotFound(id.to_string())),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl JobStore for FirestoreJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<bool> {
        Ok(self.jobs.create(job).await?)
    }

    async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.jobs.get(job_id).await?.map(|v| v.value))
    }

    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> StoreResult<bool> {
        for _ in 0..CAS_ATTEMPTS {
            let stored = self
                .jobs
                .get(&job.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(job.id.to_string()))?;
            if !expected.contains(&stored.value.status) {
                return Ok(false);
            }
            check_job_transition(job, stored.value.status)?;
            let result = self.jobs.save(job, stored.update_time.as_deref()).await;
            if cas_outcome(result, job.id.as_str())? {
                return Ok(true);
            }
        }
        Err(StoreError::conflict(format!("job {} kept changing during update", job.id)))
    }

    async fn touch_job_heartbeat(&self, job_id: &JobId) -> StoreResult<()> {
        match self.jobs.touch_heartbeat(job_id, Utc::now()).await {
            Ok(()) => Ok(()),
            Err(FirestoreError::NotFound(_)) => Err(StoreError::NotFound(job_id.to_string())),
            Err(e) if e.is_precondition_failed() => Err(StoreError::NotFound(job_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .list_by_status(statuses)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn create_chunk(&self, chunk: &Chunk) -> StoreResult<bool> {
        Ok(self.chunks.create(chunk).await?)
    }

    async fn get_chunk(&self, chunk_id: &ChunkId) -> StoreResult<Option<Chunk>> {
        Ok(self.chunks.get(chunk_id).await?.map(|v| v.value))
    }

    async fn transition_chunk(&self, chunk: &Chunk, expected: ChunkStatus) -> StoreResult<bool> {
        check_chunk_transition(chunk, expected)?;
        for _ in 0..CAS_ATTEMPTS {
            let stored = self
                .chunks
                .get(&chunk.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(chunk.id.to_string()))?;
            if stored.value.status != expected {
                return Ok(false);
            }
            let now = Utc::now();
            let mut next = chunk.clone();
            next.updated_at = now;
            if next.status == ChunkStatus::Analyzing {
                next.analysis_started_at = Some(now);
            }
            let result = self.chunks.save(&next, stored.update_time.as_deref()).await;
            if cas_outcome(result, chunk.id.as_str())? {
                return Ok(true);
            }
        }
        Err(StoreError::conflict(format!("chunk {} kept changing during update", chunk.id)))
    }

    async fn list_chunks(&self, job_id: &JobId) -> StoreResult<Vec<Chunk>> {
        Ok(self
            .chunks
            .list_for_job(job_id)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    async fn list_stage(&self, sequence: u32, status: ChunkStatus) -> StoreResult<Vec<Chunk>> {
        Ok(self
            .chunks
            .list_stage(sequence, status)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    async fn append_events(&self, job_id: &JobId, events: &[ProcessedEvent]) -> StoreResult<usize> {
        Ok(self.events.append_events(job_id, events).await?)
    }

    async fn list_events(&self, job_id: &JobId) -> StoreResult<Vec<ProcessedEvent>> {
        Ok(self.events.list_events(job_id).await?)
    }

    async fn insert_entities(&self, job_id: &JobId, entities: &[IdentifiedEntity]) -> StoreResult<usize> {
        Ok(self.events.insert_entities(job_id, entities).await?)
    }

    async fn list_entities(&self, job_id: &JobId) -> StoreResult<Vec<IdentifiedEntity>> {
        Ok(self.events.list_entities(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_outcome_maps_precondition_to_retry() {
        let lost = cas_outcome::<()>(Err(FirestoreError::PreconditionFailed("stale".into())), "job_1");
        assert!(!lost.unwrap());

        let won = cas_outcome(Ok(()), "job_1");
        assert!(won.unwrap());

        let missing = cas_outcome::<()>(Err(FirestoreError::NotFound("gone".into())), "job_1");
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        let other = cas_outcome::<()>(Err(FirestoreError::ServerError(503, "down".into())), "job_1");
        assert!(matches!(other, Err(StoreError::Firestore(_))));
    }
}
