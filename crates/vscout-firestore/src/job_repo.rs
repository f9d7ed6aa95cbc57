//! Job repository.

use chrono::{DateTime, Utc};
use tracing::debug;
use vscout_models::{Job, JobId, JobStatus, VideoId};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::fields::{FieldMap, FieldReader};
use crate::types::{Document, Filter, Precondition, StructuredQuery, ToFirestoreValue};
use crate::{Versioned, JOBS_COLLECTION};

/// Repository for `analysis_jobs/{job_id}` documents.
#[derive(Clone)]
pub struct JobRepository {
    client: FirestoreClient,
}

impl JobRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    pub async fn get(&self, job_id: &JobId) -> FirestoreResult<Option<Versioned<Job>>> {
        match self.client.get_document(JOBS_COLLECTION, job_id.as_str()).await? {
            Some(doc) => Ok(Some(versioned(&doc)?)),
            None => Ok(None),
        }
    }

    /// Insert a new job. Returns `false` when a job with the same id exists.
    pub async fn create(&self, job: &Job) -> FirestoreResult<bool> {
        match self
            .client
            .create_document(JOBS_COLLECTION, job.id.as_str(), job_to_fields(job))
            .await
        {
            Ok(_) => Ok(true),
            Err(FirestoreError::AlreadyExists(_)) => {
                debug!(job_id = %job.id, "Job already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the stored job. The write only lands if nobody has written
    /// the job since the read that returned `expected_update_time`,
    /// otherwise [`FirestoreError::PreconditionFailed`] is returned.
    ///
    /// Returns the new update time.
    pub async fn save(&self, job: &Job, expected_update_time: Option<&str>) -> FirestoreResult<Option<String>> {
        let doc = self
            .client
            .update_document(
                JOBS_COLLECTION,
                job.id.as_str(),
                job_to_fields(job),
                None,
                Some(&Precondition::unchanged_since(expected_update_time)),
            )
            .await?;
        Ok(doc.update_time)
    }

    /// Refresh the liveness timestamp without touching other fields.
    pub async fn touch_heartbeat(&self, job_id: &JobId, at: DateTime<Utc>) -> FirestoreResult<()> {
        let fields = FieldMap::new()
            .set("last_heartbeat", at)
            .set("updated_at", at)
            .into_inner();
        self.client
            .update_document(
                JOBS_COLLECTION,
                job_id.as_str(),
                fields,
                Some(&["last_heartbeat", "updated_at"]),
                Some(&Precondition::exists()),
            )
            .await?;
        Ok(())
    }

    /// Jobs currently in any of `statuses`.
    pub async fn list_by_status(&self, statuses: &[JobStatus]) -> FirestoreResult<Vec<Versioned<Job>>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let values = statuses.iter().map(|s| s.as_str().to_firestore_value()).collect();
        let query = StructuredQuery::collection(JOBS_COLLECTION).filter_all(vec![Filter::in_values("status", values)]);

        self.client
            .run_query("", query)
            .await?
            .iter()
            .map(versioned)
            .collect()
    }

    pub async fn delete(&self, job_id: &JobId) -> FirestoreResult<()> {
        self.client.delete_document(JOBS_COLLECTION, job_id.as_str()).await
    }
}

fn versioned(doc: &Document) -> FirestoreResult<Versioned<Job>> {
    Ok(Versioned {
        value: job_from_document(doc)?,
        update_time: doc.update_time.clone(),
    })
}

pub(crate) fn job_to_fields(job: &Job) -> std::collections::HashMap<String, crate::Value> {
    FieldMap::new()
        .set("id", job.id.as_str())
        .set("video_id", job.video_id.as_str())
        .set("source_path", job.source_path.as_str())
        .set("user_id", job.user_id.as_str())
        .set("status", job.status.as_str())
        .set_opt("failure_reason", job.failure_reason.clone())
        .set("retry_count", job.retry_count)
        .set_opt("last_heartbeat", job.last_heartbeat)
        .set("created_at", job.created_at)
        .set("updated_at", job.updated_at)
        .set_opt("completed_at", job.completed_at)
        .into_inner()
}

pub(crate) fn job_from_document(doc: &Document) -> FirestoreResult<Job> {
    let context = doc.name.as_deref().unwrap_or(JOBS_COLLECTION);
    let f = FieldReader::new(doc, context)?;

    let id = match f.opt::<String>("id") {
        Some(id) => id,
        None => doc
            .id()
            .map(str::to_string)
            .ok_or_else(|| FirestoreError::invalid_response(format!("{}: no job id", context)))?,
    };

    Ok(Job {
        id: JobId::from_string(id),
        video_id: VideoId::from(f.req::<String>("video_id")?),
        source_path: f.req("source_path")?,
        user_id: f.opt("user_id").unwrap_or_default(),
        status: f.parsed("status")?,
        failure_reason: f.opt("failure_reason"),
        retry_count: f.opt("retry_count").unwrap_or(0),
        last_heartbeat: f.opt("last_heartbeat"),
        created_at: f.timestamp("created_at")?,
        updated_at: f.timestamp("updated_at")?,
        completed_at: f.opt("completed_at"),
    })
}
