//! Startup and periodic sweep over non-terminal jobs.
//!
//! Re-finalizes jobs whose last chunk event was lost, demotes PROCESSING
//! jobs with a stale heartbeat to RETRYABLE_FAILED, and resubmits
//! RETRYABLE_FAILED jobs so the orchestrator gives them another pass.

use chrono::Utc;
use tracing::{info, warn};
use vscout_models::JobStatus;
use vscout_queue::SubmitVideo;

use crate::context::PipelineContext;
use crate::error::WorkerResult;
use crate::finalizer::{FinalizeOutcome, Finalizer};
use crate::metrics;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs this sweep moved to a terminal status
    pub finalized: usize,
    pub demoted: usize,
    pub resubmitted: usize,
}

pub struct Reconciler {
    ctx: PipelineContext,
    finalizer: Finalizer,
}

impl Reconciler {
    pub fn new(ctx: PipelineContext) -> Self {
        let finalizer = Finalizer::new(ctx.clone());
        Self { ctx, finalizer }
    }

    pub async fn run_once(&self) -> WorkerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let store = &self.ctx.store;

        for job in store
            .list_jobs_by_status(&[JobStatus::Processing, JobStatus::RetryableFailed])
            .await?
        {
            match self.finalizer.finalize(&job.id).await {
                Ok(FinalizeOutcome::Completed | FinalizeOutcome::Failed { .. }) => report.finalized += 1,
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, "Reconciler finalize failed: {}", e),
            }
        }

        let threshold = self.ctx.config.stale_job_threshold.as_secs() as i64;
        let now = Utc::now();
        for job in store.list_jobs_by_status(&[JobStatus::Processing]).await? {
            if !job.is_stale(threshold, now) {
                continue;
            }
            let mut demoted = job.clone();
            demoted.failure_reason = Some(format!("No heartbeat for {}s; marked for retry", threshold));
            demoted.set_status(JobStatus::RetryableFailed);
            match store.transition_job(&demoted, &[JobStatus::Processing]).await {
                Ok(true) => {
                    warn!(
                        job_id = %job.id,
                        last_heartbeat = ?job.last_heartbeat,
                        "Demoted stale job to retryable_failed"
                    );
                    metrics::record_job_demoted();
                    report.demoted += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, "Failed to demote stale job: {}", e),
            }
        }

        if self.ctx.config.reconciler_resubmit {
            for job in store.list_jobs_by_status(&[JobStatus::RetryableFailed]).await? {
                let message = SubmitVideo::new(job.video_id.clone(), &job.source_path, &job.user_id);
                match self.ctx.publisher.publish_submit(&message).await {
                    Ok(_) => report.resubmitted += 1,
                    Err(e) => warn!(job_id = %job.id, "Failed to resubmit job: {}", e),
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                finalized = report.finalized,
                demoted = report.demoted,
                resubmitted = report.resubmitted,
                "Reconciler sweep"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use vscout_models::{Chunk, ChunkStatus, Job, ProcessingMode};

    use super::*;
    use crate::test_support::{test_config, Harness};
    use crate::store::JobStore;

    /// A PROCESSING job whose chunks all finished before the worker died.
    async fn seed_orphaned_job(h: &Harness, video: &str, chunk_status: ChunkStatus) -> Job {
        let mut job = Job::new(video.into(), &format!("/videos/{}.mp4", video), "user-1");
        job.set_status(JobStatus::Processing);
        h.store.put_job(job.clone()).await;
        for sequence in 0..2 {
            let mut chunk = Chunk::new(job.id.clone(), sequence, sequence as f64 * 120.0, 150.0);
            chunk.set_status(chunk_status);
            h.store.put_chunk(chunk).await;
        }
        job
    }

    #[tokio::test]
    async fn test_sweep_finalizes_orphaned_job_once() {
        let h = Harness::new(test_config(ProcessingMode::Parallel), 240.0);
        let job = seed_orphaned_job(&h, "game-orphan", ChunkStatus::Completed).await;
        let reconciler = Reconciler::new(h.ctx.clone());

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(report.demoted, 0);

        let results = h.publisher.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].job_id, job.id);
        assert_eq!(results[0].status, JobStatus::Completed);
        let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let again = reconciler.run_once().await.unwrap();
        assert_eq!(again, ReconcileReport::default());
        assert_eq!(h.publisher.results().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_fails_job_with_failed_chunk() {
        let h = Harness::new(test_config(ProcessingMode::Parallel), 240.0);
        let job = seed_orphaned_job(&h, "game-orphan-failed", ChunkStatus::Failed).await;

        let report = Reconciler::new(h.ctx.clone()).run_once().await.unwrap();
        assert_eq!(report.finalized, 1);
        let results = h.publisher.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobStatus::Failed);
        assert!(h.store.get_job(&job.id).await.unwrap().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_sweep_leaves_in_flight_job_alone() {
        let h = Harness::new(test_config(ProcessingMode::Parallel), 240.0);
        let mut job = seed_orphaned_job(&h, "game-busy", ChunkStatus::Analyzing).await;
        job.last_heartbeat = Some(Utc::now());
        h.store.put_job(job.clone()).await;

        let report = Reconciler::new(h.ctx.clone()).run_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert!(h.publisher.results().is_empty());
    }
}
