//! Accepted events and identified entities, stored as per-job
//! subcollections keyed by event id and entity id.
//!
//! Both are insert-only: a write whose id is already present is skipped by
//! the store, so appending the same batch twice is harmless.

use std::collections::HashMap;

use tracing::{debug, warn};
use vscout_models::{sort_by_timeline, IdentifiedEntity, JobId, ProcessedEvent};

use crate::client::{FirestoreClient, MAX_BATCH_WRITES};
use crate::error::{FirestoreError, FirestoreResult};
use crate::fields::{FieldMap, FieldReader};
use crate::metrics::record_batch_outcome;
use crate::types::{Document, Value, Write, WriteOutcome};
use crate::{ENTITIES_SUBCOLLECTION, EVENTS_SUBCOLLECTION, JOBS_COLLECTION};

#[derive(Clone)]
pub struct EventRepository {
    client: FirestoreClient,
}

impl EventRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    fn events_path(job_id: &JobId) -> String {
        format!("{}/{}/{}", JOBS_COLLECTION, job_id, EVENTS_SUBCOLLECTION)
    }

    fn entities_path(job_id: &JobId) -> String {
        format!("{}/{}/{}", JOBS_COLLECTION, job_id, ENTITIES_SUBCOLLECTION)
    }

    /// All accepted events for a job, ordered by absolute timestamp.
    pub async fn list_events(&self, job_id: &JobId) -> FirestoreResult<Vec<ProcessedEvent>> {
        let docs = self.client.list_all_documents(&Self::events_path(job_id)).await?;
        let mut events = docs.iter().map(event_from_document).collect::<FirestoreResult<Vec<_>>>()?;
        sort_by_timeline(&mut events);
        Ok(events)
    }

    /// Insert events whose id is not yet stored. Returns how many were new.
    pub async fn append_events(&self, job_id: &JobId, events: &[ProcessedEvent]) -> FirestoreResult<usize> {
        let path = Self::events_path(job_id);
        let docs = events
            .iter()
            .map(|e| Document::named(self.client.full_document_name(&path, &e.id), event_to_fields(e)))
            .collect();
        let written = self.insert_all(docs).await?;
        debug!(job_id = %job_id, offered = events.len(), written, "Appended events");
        Ok(written)
    }

    pub async fn list_entities(&self, job_id: &JobId) -> FirestoreResult<Vec<IdentifiedEntity>> {
        let docs = self.client.list_all_documents(&Self::entities_path(job_id)).await?;
        docs.iter().map(entity_from_document).collect()
    }

    /// Insert entities not yet known. An existing entity keeps its original
    /// first-seen chunk.
    pub async fn insert_entities(&self, job_id: &JobId, entities: &[IdentifiedEntity]) -> FirestoreResult<usize> {
        let path = Self::entities_path(job_id);
        let docs = entities
            .iter()
            .map(|e| Document::named(self.client.full_document_name(&path, &e.id), entity_to_fields(e)))
            .collect();
        self.insert_all(docs).await
    }

    async fn insert_all(&self, mut docs: Vec<Document>) -> FirestoreResult<usize> {
        let mut written = 0;
        while !docs.is_empty() {
            let rest = docs.split_off(docs.len().min(MAX_BATCH_WRITES));
            let writes: Vec<Write> = docs.into_iter().map(Write::create).collect();
            let count = writes.len();
            let response = self.client.batch_write(writes).await?;

            let (mut batch_written, mut skipped) = (0u64, 0u64);
            for outcome in response.outcomes(count) {
                match outcome {
                    WriteOutcome::Written => batch_written += 1,
                    WriteOutcome::AlreadyExists => skipped += 1,
                    WriteOutcome::Failed(code) => {
                        let message = response
                            .first_failure()
                            .and_then(|(_, s)| s.message.clone())
                            .unwrap_or_default();
                        warn!(code, message = %message, "Batch insert write failed");
                        record_batch_outcome("failed", 1);
                        return Err(FirestoreError::request_failed(format!(
                            "batch insert failed with code {}: {}",
                            code, message
                        )));
                    }
                }
            }
            record_batch_outcome("written", batch_written);
            record_batch_outcome("already_exists", skipped);
            written += batch_written as usize;
            docs = rest;
        }
        Ok(written)
    }
}

fn event_to_fields(event: &ProcessedEvent) -> HashMap<String, Value> {
    FieldMap::new()
        .set("id", event.id.as_str())
        .set("job_id", event.job_id.as_str())
        .set("event_type", event.event_type.as_str())
        .set("timestamp_secs", event.timestamp_secs)
        .set("timestamp", event.timestamp.as_str())
        .set_opt("player_id", event.player_id.clone())
        .set_opt("team_id", event.team_id.clone())
        .set_opt("description", event.description.clone())
        .set_opt("confidence", event.confidence)
        .set("chunk_sequence", event.chunk_sequence)
        .set("window_start_secs", event.window_start_secs)
        .set("window_end_secs", event.window_end_secs)
        .set("dedup_key", event.dedup_key.as_str())
        .set("created_at", event.created_at)
        .into_inner()
}

fn event_from_document(doc: &Document) -> FirestoreResult<ProcessedEvent> {
    let f = FieldReader::new(doc, doc.name.as_deref().unwrap_or(EVENTS_SUBCOLLECTION))?;
    Ok(ProcessedEvent {
        id: f.req("id")?,
        job_id: JobId::from_string(f.req::<String>("job_id")?),
        event_type: f.parsed("event_type")?,
        timestamp_secs: f.req("timestamp_secs")?,
        timestamp: f.req("timestamp")?,
        player_id: f.opt("player_id"),
        team_id: f.opt("team_id"),
        description: f.opt("description"),
        confidence: f.opt("confidence"),
        chunk_sequence: f.req("chunk_sequence")?,
        window_start_secs: f.req("window_start_secs")?,
        window_end_secs: f.req("window_end_secs")?,
        dedup_key: f.req("dedup_key")?,
        created_at: f.timestamp("created_at")?,
    })
}

fn entity_to_fields(entity: &IdentifiedEntity) -> HashMap<String, Value> {
    FieldMap::new()
        .set("id", entity.id.as_str())
        .set("kind", entity.kind.as_str())
        .set("job_id", entity.job_id.as_str())
        .set_opt("side", entity.side.clone())
        .set_opt("color", entity.color.clone())
        .set_opt("jersey_number", entity.jersey_number.clone())
        .set_opt("description", entity.description.clone())
        .set_opt("team_id", entity.team_id.clone())
        .set("first_seen_chunk", entity.first_seen_chunk)
        .set("created_at", entity.created_at)
        .into_inner()
}

fn entity_from_document(doc: &Document) -> FirestoreResult<IdentifiedEntity> {
    let f = FieldReader::new(doc, doc.name.as_deref().unwrap_or(ENTITIES_SUBCOLLECTION))?;
    Ok(IdentifiedEntity {
        id: f.req("id")?,
        kind: f.parsed("kind")?,
        job_id: JobId::from_string(f.req::<String>("job_id")?),
        side: f.opt("side"),
        color: f.opt("color"),
        jersey_number: f.opt("jersey_number"),
        description: f.opt("description"),
        team_id: f.opt("team_id"),
        first_seen_chunk: f.opt("first_seen_chunk").unwrap_or(0),
        created_at: f.timestamp("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vscout_models::{EntityKind, EventType};

    #[test]
    fn test_event_document_round_trip() {
        let event = ProcessedEvent {
            id: ProcessedEvent::id_for_key("goal:24:player_1"),
            job_id: JobId::from_string("job_1"),
            event_type: EventType::Goal,
            timestamp_secs: 121.5,
            timestamp: "00:02:01.500".into(),
            player_id: Some("player_1".into()),
            team_id: None,
            description: Some("header from a corner".into()),
            confidence: Some(0.9),
            chunk_sequence: 1,
            window_start_secs: 120.0,
            window_end_secs: 270.0,
            dedup_key: "goal:24:player_1".into(),
            created_at: Utc::now(),
        };
        let restored = event_from_document(&Document::new(event_to_fields(&event))).unwrap();
        assert_eq!(restored.id, event.id);
        assert_eq!(restored.event_type, EventType::Goal);
        assert_eq!(restored.player_id.as_deref(), Some("player_1"));
        assert!(restored.team_id.is_none());
        assert_eq!(restored.confidence, Some(0.9));
    }

    #[test]
    fn test_entity_document_round_trip() {
        let team = IdentifiedEntity::team(
            JobId::from_string("job_1"),
            Some("home".into()),
            Some("red".into()),
            None,
            2,
        );
        let restored = entity_from_document(&Document::new(entity_to_fields(&team))).unwrap();
        assert_eq!(restored.kind, EntityKind::Team);
        assert_eq!(restored.id, team.id);
        assert_eq!(restored.first_seen_chunk, 2);
    }

    #[test]
    fn test_subcollection_paths() {
        let job = JobId::from_string("job_9");
        assert_eq!(EventRepository::events_path(&job), "analysis_jobs/job_9/events");
        assert_eq!(EventRepository::entities_path(&job), "analysis_jobs/job_9/entities");
    }
}
