//! Chunk repository.
//!
//! Chunks live in a top-level collection so that a stage (every chunk with
//! the same sequence number, across jobs) is one query.

use std::collections::HashMap;

use tracing::debug;
use vscout_models::{Chunk, ChunkId, ChunkStatus, JobId};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::fields::{FieldMap, FieldReader};
use crate::types::{Document, Filter, Precondition, StructuredQuery, ToFirestoreValue, Value};
use crate::{Versioned, CHUNKS_COLLECTION};

#[derive(Clone)]
pub struct ChunkRepository {
    client: FirestoreClient,
}

impl ChunkRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    pub async fn get(&self, chunk_id: &ChunkId) -> FirestoreResult<Option<Versioned<Chunk>>> {
        match self.client.get_document(CHUNKS_COLLECTION, chunk_id.as_str()).await? {
            Some(doc) => Ok(Some(versioned(&doc)?)),
            None => Ok(None),
        }
    }

    /// Insert a chunk. Returns `false` when (job, sequence) already exists.
    pub async fn create(&self, chunk: &Chunk) -> FirestoreResult<bool> {
        match self
            .client
            .create_document(CHUNKS_COLLECTION, chunk.id.as_str(), chunk_to_fields(chunk))
            .await
        {
            Ok(_) => Ok(true),
            Err(FirestoreError::AlreadyExists(_)) => {
                debug!(chunk_id = %chunk.id, "Chunk already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the stored chunk, guarded by `expected_update_time` when given.
    pub async fn save(&self, chunk: &Chunk, expected_update_time: Option<&str>) -> FirestoreResult<Option<String>> {
        let doc = self
            .client
            .update_document(
                CHUNKS_COLLECTION,
                chunk.id.as_str(),
                chunk_to_fields(chunk),
                None,
                Some(&Precondition::unchanged_since(expected_update_time)),
            )
            .await?;
        Ok(doc.update_time)
    }

    /// Every chunk of a job, ordered by sequence.
    pub async fn list_for_job(&self, job_id: &JobId) -> FirestoreResult<Vec<Versioned<Chunk>>> {
        let query = StructuredQuery::collection(CHUNKS_COLLECTION)
            .filter_all(vec![Filter::equal("job_id", job_id.as_str().to_firestore_value())]);
        let mut chunks = self.query(query).await?;
        chunks.sort_by_key(|c| c.value.sequence);
        Ok(chunks)
    }

    /// Chunks of stage `sequence` currently in `status`, across all jobs.
    pub async fn list_stage(&self, sequence: u32, status: ChunkStatus) -> FirestoreResult<Vec<Versioned<Chunk>>> {
        let query = StructuredQuery::collection(CHUNKS_COLLECTION).filter_all(vec![
            Filter::equal("status", status.as_str().to_firestore_value()),
            Filter::equal("sequence", sequence.to_firestore_value()),
        ]);
        self.query(query).await
    }

    pub async fn delete(&self, chunk_id: &ChunkId) -> FirestoreResult<()> {
        self.client.delete_document(CHUNKS_COLLECTION, chunk_id.as_str()).await
    }

    async fn query(&self, query: StructuredQuery) -> FirestoreResult<Vec<Versioned<Chunk>>> {
        self.client
            .run_query("", query)
            .await?
            .iter()
            .map(versioned)
            .collect()
    }
}

fn versioned(doc: &Document) -> FirestoreResult<Versioned<Chunk>> {
    Ok(Versioned {
        value: chunk_from_document(doc)?,
        update_time: doc.update_time.clone(),
    })
}

pub(crate) fn chunk_to_fields(chunk: &Chunk) -> HashMap<String, Value> {
    FieldMap::new()
        .set("id", chunk.id.as_str())
        .set("job_id", chunk.job_id.as_str())
        .set("sequence", chunk.sequence)
        .set("start_secs", chunk.start_secs)
        .set("duration_secs", chunk.duration_secs)
        .set("artifact_path", chunk.artifact_path.as_str())
        .set("status", chunk.status.as_str())
        .set_opt("failure_reason", chunk.failure_reason.clone())
        .set_opt("continuation_token", chunk.continuation_token.clone())
        .set_opt("raw_response", chunk.raw_response.clone())
        .set_opt("analysis_started_at", chunk.analysis_started_at)
        .set("created_at", chunk.created_at)
        .set("updated_at", chunk.updated_at)
        .into_inner()
}

pub(crate) fn chunk_from_document(doc: &Document) -> FirestoreResult<Chunk> {
    let context = doc.name.as_deref().unwrap_or(CHUNKS_COLLECTION);
    let f = FieldReader::new(doc, context)?;
    let job_id = JobId::from_string(f.req::<String>("job_id")?);
    let sequence: u32 = f.req("sequence")?;

    Ok(Chunk {
        id: f
            .opt::<String>("id")
            .map(ChunkId::from_string)
            .unwrap_or_else(|| ChunkId::for_sequence(&job_id, sequence)),
        job_id,
        sequence,
        start_secs: f.req("start_secs")?,
        duration_secs: f.req("duration_secs")?,
        artifact_path: f.opt("artifact_path").unwrap_or_default(),
        status: f.parsed("status")?,
        failure_reason: f.opt("failure_reason"),
        continuation_token: f.opt("continuation_token"),
        raw_response: f.opt("raw_response"),
        analysis_started_at: f.opt("analysis_started_at"),
        created_at: f.timestamp("created_at")?,
        updated_at: f.timestamp("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_document_round_trip() {
        let job_id = JobId::from_string("job_abc");
        let mut chunk = Chunk::new(job_id.clone(), 3, 360.0, 150.0);
        chunk.artifact_path = "/tmp/vscout/job_abc/chunk_00003.mp4".into();
        chunk.set_status(ChunkStatus::Analyzing);
        chunk.continuation_token = Some("ctx-2".into());

        let restored = chunk_from_document(&Document::new(chunk_to_fields(&chunk))).unwrap();
        assert_eq!(restored.id, ChunkId::for_sequence(&job_id, 3));
        assert_eq!(restored.status, ChunkStatus::Analyzing);
        assert_eq!(restored.start_secs, 360.0);
        assert_eq!(restored.continuation_token.as_deref(), Some("ctx-2"));
        assert!(restored.analysis_started_at.is_some());
        assert!(restored.failure_reason.is_none());
    }

    #[test]
    fn test_integer_durations_accepted() {
        let chunk = Chunk::new(JobId::from_string("job_x"), 0, 0.0, 150.0);
        let mut fields = chunk_to_fields(&chunk);
        fields.insert("duration_secs".into(), Value::IntegerValue("150".into()));
        fields.remove("id");
        let restored = chunk_from_document(&Document::new(fields)).unwrap();
        assert_eq!(restored.duration_secs, 150.0);
        assert_eq!(restored.id.as_str(), "job_x_00000");
    }
}
