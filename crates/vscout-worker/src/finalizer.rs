//! Job finalization: turn per-chunk outcomes into one terminal job status.
//!
//! Safe to call redundantly and concurrently. The terminal write is a
//! compare-and-set from a non-terminal status, and only the caller that
//! wins it publishes the result and removes artifacts.

use tracing::{debug, info, warn};
use vscout_models::{Chunk, ChunkStatus, Job, JobId, JobStatus};
use vscout_queue::JobResult;

use crate::context::PipelineContext;
use crate::error::WorkerResult;
use crate::logging::JobLogger;
use crate::metrics;

/// Non-terminal statuses a job may be finalized from.
const OPEN_STATUSES: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Processing, JobStatus::RetryableFailed];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Missing or already terminal; nothing to do.
    AlreadyTerminal,
    /// No chunks planned yet.
    Deferred,
    /// Some chunks are still moving.
    InFlight { completed: usize, total: usize },
    Completed,
    Failed { reason: String },
}

/// Aggregate chunk statuses into a verdict. `None` means still in flight.
pub fn decide(chunks: &[Chunk]) -> Option<Result<(), String>> {
    let failed: Vec<&Chunk> = chunks.iter().filter(|c| c.status == ChunkStatus::Failed).collect();
    if !failed.is_empty() {
        return Some(Err(failure_reason(&failed)));
    }
    if chunks.iter().all(|c| c.status == ChunkStatus::Completed) {
        return Some(Ok(()));
    }
    None
}

/// `"N chunk(s) failed: chunk 2: <reason>; chunk 5: <reason>"`
pub fn failure_reason(failed: &[&Chunk]) -> String {
    let details = failed
        .iter()
        .map(|c| {
            format!(
                "chunk {}: {}",
                c.sequence,
                c.failure_reason.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} chunk(s) failed: {}", failed.len(), details)
}

/// Finalizes jobs against the store and announces terminal outcomes.
#[derive(Clone)]
pub struct Finalizer {
    ctx: PipelineContext,
}

impl Finalizer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn finalize(&self, job_id: &JobId) -> WorkerResult<FinalizeOutcome> {
        let Some(job) = self.ctx.store.get_job(job_id).await? else {
            debug!(job_id = %job_id, "Finalize skipped: job not found");
            return Ok(FinalizeOutcome::AlreadyTerminal);
        };
        if job.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyTerminal);
        }

        let chunks = self.ctx.store.list_chunks(job_id).await?;
        if chunks.is_empty() {
            return Ok(FinalizeOutcome::Deferred);
        }

        match decide(&chunks) {
            None => {
                let completed = chunks.iter().filter(|c| c.status == ChunkStatus::Completed).count();
                Ok(FinalizeOutcome::InFlight {
                    completed,
                    total: chunks.len(),
                })
            }
            Some(Ok(())) => {
                let mut next = job;
                next.failure_reason = None;
                next.set_status(JobStatus::Completed);
                if self.conclude(next, &chunks).await? {
                    Ok(FinalizeOutcome::Completed)
                } else {
                    Ok(FinalizeOutcome::AlreadyTerminal)
                }
            }
            Some(Err(reason)) => {
                let mut next = job;
                next.fail(reason.clone());
                if self.conclude(next, &chunks).await? {
                    Ok(FinalizeOutcome::Failed { reason })
                } else {
                    Ok(FinalizeOutcome::AlreadyTerminal)
                }
            }
        }
    }

    /// Fail a job outright, outside the chunk aggregate. Returns whether
    /// this call made the transition.
    pub async fn fail_job(&self, job_id: &JobId, reason: &str) -> WorkerResult<bool> {
        let Some(job) = self.ctx.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.is_terminal() {
            return Ok(false);
        }
        let chunks = self.ctx.store.list_chunks(job_id).await?;
        let mut next = job;
        next.fail(reason);
        self.conclude(next, &chunks).await
    }

    /// Write the terminal status; on winning, publish and clean up.
    async fn conclude(&self, job: Job, chunks: &[Chunk]) -> WorkerResult<bool> {
        let logger = JobLogger::new(&job.id, "finalize");

        // Pending only when a job is failed before its first pass.
        let expected: &[JobStatus] = if job.status == JobStatus::Failed {
            &OPEN_STATUSES
        } else {
            &OPEN_STATUSES[1..]
        };
        if !self.ctx.store.transition_job(&job, expected).await? {
            debug!(job_id = %job.id, "Another worker finalized the job");
            return Ok(false);
        }
        metrics::record_job_finalized(job.status.as_str());

        let events = match job.status {
            JobStatus::Completed => Some(self.ctx.store.list_events(&job.id).await?),
            _ => None,
        };
        let result = JobResult {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            user_id: job.user_id.clone(),
            status: job.status,
            events,
            failure_reason: job.failure_reason.clone(),
        };
        if let Err(e) = self.ctx.publisher.publish_result(&result).await {
            logger.log_error(&format!("Failed to publish job result: {}", e));
        }

        self.cleanup(chunks).await;

        match job.status {
            JobStatus::Completed => logger.log_completion(&format!("{} chunk(s) analyzed", chunks.len())),
            _ => info!(
                job_id = %job.id,
                reason = job.failure_reason.as_deref().unwrap_or_default(),
                "Job failed"
            ),
        }
        Ok(true)
    }

    async fn cleanup(&self, chunks: &[Chunk]) {
        for chunk in chunks.iter().filter(|c| !c.artifact_path.is_empty()) {
            if let Err(e) = self.ctx.splitter.remove_artifact(&chunk.artifact_path).await {
                warn!(
                    chunk_id = %chunk.id,
                    path = %chunk.artifact_path,
                    "Failed to remove chunk artifact: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u32, status: ChunkStatus) -> Chunk {
        let mut chunk = Chunk::new(JobId::from_string("job_1"), sequence, sequence as f64 * 120.0, 150.0);
        chunk.status = status;
        chunk
    }

    #[test]
    fn test_decide_all_completed() {
        let chunks = vec![chunk(0, ChunkStatus::Completed), chunk(1, ChunkStatus::Completed)];
        assert_eq!(decide(&chunks), Some(Ok(())));
    }

    #[test]
    fn test_decide_failure_wins_over_in_flight() {
        let mut failed = chunk(2, ChunkStatus::Failed);
        failed.failure_reason = Some("rejected".into());
        let chunks = vec![chunk(0, ChunkStatus::Completed), chunk(1, ChunkStatus::Analyzing), failed];
        assert_eq!(decide(&chunks), Some(Err("1 chunk(s) failed: chunk 2: rejected".into())));
    }

    #[test]
    fn test_decide_retryable_is_in_flight() {
        let chunks = vec![chunk(0, ChunkStatus::Completed), chunk(1, ChunkStatus::RetryableFailed)];
        assert_eq!(decide(&chunks), None);
    }

    #[test]
    fn test_failure_reason_lists_every_chunk() {
        let mut a = chunk(2, ChunkStatus::Failed);
        a.failure_reason = Some("bad".into());
        let b = chunk(5, ChunkStatus::Failed);
        assert_eq!(
            failure_reason(&[&a, &b]),
            "2 chunk(s) failed: chunk 2: bad; chunk 5: unknown error"
        );
    }
}
