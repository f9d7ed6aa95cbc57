//! Job intake, resumption and chunk planning.
//!
//! `submit` is idempotent: the job id is derived from (video, source path)
//! and chunk rows from (job, sequence), so repeated or concurrent intake
//! of the same video converges on one job with one row per sequence.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vscout_media::SplitRequest;
use vscout_models::{plan_chunks, Chunk, ChunkStatus, Job, JobStatus, PlannedChunk, ProcessingMode};
use vscout_queue::{AnalyzeChunk, SubmitVideo};

use crate::context::PipelineContext;
use crate::error::{StoreError, WorkerError, WorkerResult};
use crate::finalizer::{FinalizeOutcome, Finalizer};
use crate::logging::JobLogger;

/// Counters for one planning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlanReport {
    pub planned: usize,
    /// Chunks split and handed to analysis in this pass
    pub materialized: usize,
    /// AWAITING_ANALYSIS chunks whose analyze message was sent again
    pub republished: usize,
    pub skipped: usize,
    pub negligible: usize,
    pub split_failures: usize,
    pub publish_failures: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The job had already reached `status`; nothing was done.
    AlreadyTerminal(JobStatus),
    /// The job was failed because it used up its retries.
    RetriesExhausted,
    /// A planning pass ran. `settled` is the status observed at the end of
    /// the sequential-mode wait (`None` in parallel mode or on timeout).
    Planned {
        report: PlanReport,
        finalized: FinalizeOutcome,
        settled: Option<JobStatus>,
    },
}

pub struct Orchestrator {
    ctx: PipelineContext,
    finalizer: Finalizer,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        let finalizer = Finalizer::new(ctx.clone());
        Self { ctx, finalizer }
    }

    /// Create or resume the job for `request` and run one planning pass.
    pub async fn submit(&self, request: &SubmitVideo) -> WorkerResult<SubmitOutcome> {
        let candidate = Job::new(request.video_id.clone(), &request.source_path, &request.user_id);
        let logger = JobLogger::new(&candidate.id, "orchestrate");

        let job = if self.ctx.store.create_job(&candidate).await? {
            logger.log_start(&format!("new job for {}", request.source_path));
            candidate
        } else {
            self.ctx
                .store
                .get_job(&candidate.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(candidate.id.to_string()))?
        };

        let (job, resumed_from_retry) = match job.status {
            JobStatus::Completed | JobStatus::Failed => {
                debug!(job_id = %job.id, status = %job.status, "Job already terminal; acknowledging intake");
                return Ok(SubmitOutcome::AlreadyTerminal(job.status));
            }
            JobStatus::RetryableFailed => {
                let attempt = job.retry_count + 1;
                if attempt > self.ctx.config.max_job_retries {
                    let reason = format!(
                        "Retries exhausted after {} attempt(s): {}",
                        job.retry_count,
                        job.failure_reason.as_deref().unwrap_or("unknown error")
                    );
                    logger.log_error(&reason);
                    self.finalizer.fail_job(&job.id, &reason).await?;
                    return Ok(SubmitOutcome::RetriesExhausted);
                }
                logger.log_progress(&format!("resuming, attempt {} of {}", attempt, self.ctx.config.max_job_retries));
                let mut next = job.clone();
                next.retry_count = attempt;
                next.failure_reason = None;
                self.start_processing(next, JobStatus::RetryableFailed).await?
            }
            JobStatus::Pending => {
                let (job, _) = self.start_processing(job, JobStatus::Pending).await?;
                (job, false)
            }
            JobStatus::Processing => {
                debug!(job_id = %job.id, "Job already processing; running another planning pass");
                (job, false)
            }
        };
        if job.is_terminal() {
            return Ok(SubmitOutcome::AlreadyTerminal(job.status));
        }

        self.ctx.store.touch_job_heartbeat(&job.id).await?;

        let plan = match self.plan(&job).await {
            Ok(plan) => plan,
            Err(e) if !e.is_retryable() => {
                let reason = format!("Planning failed: {}", e);
                logger.log_error(&reason);
                self.finalizer.fail_job(&job.id, &reason).await?;
                return Ok(SubmitOutcome::AlreadyTerminal(JobStatus::Failed));
            }
            Err(e) => return Err(e),
        };

        let report = self.run_plan(&job, &plan, resumed_from_retry).await?;
        logger.log_progress(&format!(
            "{} planned, {} materialized, {} republished, {} skipped, {} split failure(s)",
            report.planned, report.materialized, report.republished, report.skipped, report.split_failures
        ));

        let finalized = self.finalizer.finalize(&job.id).await?;

        let settled = match self.ctx.config.processing_mode {
            ProcessingMode::Parallel => None,
            ProcessingMode::Sequential => self.wait_for_job(&job).await?,
        };

        Ok(SubmitOutcome::Planned {
            report,
            finalized,
            settled,
        })
    }

    /// Move the job to PROCESSING from `from`. Returns the job and whether
    /// this pass won the transition; a lost race re-reads the job.
    async fn start_processing(&self, mut job: Job, from: JobStatus) -> WorkerResult<(Job, bool)> {
        job.set_status(JobStatus::Processing);
        if self.ctx.store.transition_job(&job, &[from]).await? {
            return Ok((job, true));
        }
        let current = self
            .ctx
            .store
            .get_job(&job.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job.id.to_string()))?;
        Ok((current, false))
    }

    async fn plan(&self, job: &Job) -> WorkerResult<Vec<PlannedChunk>> {
        let duration = self.ctx.splitter.probe_duration(&job.source_path).await?;
        let plan = plan_chunks(
            duration,
            self.ctx.config.chunk_duration_secs,
            self.ctx.config.chunk_overlap_secs,
        )?;
        info!(job_id = %job.id, duration, chunks = plan.len(), "Planned chunks");
        Ok(plan)
    }

    async fn run_plan(&self, job: &Job, plan: &[PlannedChunk], resumed_from_retry: bool) -> WorkerResult<PlanReport> {
        let mut report = PlanReport {
            planned: plan.len(),
            ..Default::default()
        };

        for planned in plan {
            let chunk = self.ensure_chunk(job, planned).await?;

            match chunk.status {
                ChunkStatus::Completed | ChunkStatus::Analyzing => report.skipped += 1,
                ChunkStatus::AwaitingAnalysis if resumed_from_retry => {
                    if self.publish_analyze(&chunk).await {
                        report.republished += 1;
                    } else {
                        report.publish_failures += 1;
                    }
                }
                ChunkStatus::AwaitingAnalysis => report.skipped += 1,
                ChunkStatus::Pending if planned.negligible => {
                    let mut next = chunk.clone();
                    next.set_status(ChunkStatus::Completed);
                    if self.ctx.store.transition_chunk(&next, ChunkStatus::Pending).await? {
                        debug!(chunk_id = %chunk.id, "Negligible tail chunk completed without analysis");
                        report.negligible += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                // CHUNKING belongs to the pass that claimed it unless that
                // pass is gone: the job was resumed or the claim went stale.
                ChunkStatus::Chunking if !resumed_from_retry && !self.is_stale(&chunk) => {
                    debug!(chunk_id = %chunk.id, "Chunk being split by another planning pass");
                    report.skipped += 1;
                }
                ChunkStatus::Pending | ChunkStatus::Chunking | ChunkStatus::Failed | ChunkStatus::RetryableFailed => {
                    self.materialize(job, chunk, &mut report).await?;
                }
            }
        }

        Ok(report)
    }

    fn is_stale(&self, chunk: &Chunk) -> bool {
        let age = Utc::now().signed_duration_since(chunk.updated_at);
        age.to_std().map_or(false, |age| age > self.ctx.config.stale_job_threshold)
    }

    /// Create-if-absent, reading back the row another writer created.
    async fn ensure_chunk(&self, job: &Job, planned: &PlannedChunk) -> WorkerResult<Chunk> {
        let chunk = Chunk::new(job.id.clone(), planned.sequence, planned.start_secs, planned.duration_secs);
        if self.ctx.store.create_chunk(&chunk).await? {
            return Ok(chunk);
        }
        Ok(self
            .ctx
            .store
            .get_chunk(&chunk.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(chunk.id.to_string()))?)
    }

    /// CHUNKING, split, AWAITING_ANALYSIS, publish.
    async fn materialize(&self, job: &Job, chunk: Chunk, report: &mut PlanReport) -> WorkerResult<()> {
        let mut chunking = chunk.clone();
        chunking.set_status(ChunkStatus::Chunking);
        if !self.ctx.store.transition_chunk(&chunking, chunk.status).await? {
            debug!(chunk_id = %chunk.id, "Chunk claimed by another planning pass");
            report.skipped += 1;
            return Ok(());
        }

        let request = SplitRequest {
            job_id: job.id.clone(),
            source_path: job.source_path.clone(),
            sequence: chunk.sequence,
            start_secs: chunk.start_secs,
            duration_secs: chunk.duration_secs,
        };
        match self.ctx.splitter.split(&request).await {
            Ok(path) => {
                let mut ready = chunking.clone();
                ready.artifact_path = path.to_string_lossy().into_owned();
                ready.set_status(ChunkStatus::AwaitingAnalysis);
                if !self.ctx.store.transition_chunk(&ready, ChunkStatus::Chunking).await? {
                    report.skipped += 1;
                    return Ok(());
                }
                report.materialized += 1;
                if !self.publish_analyze(&ready).await {
                    report.publish_failures += 1;
                }
            }
            Err(e) => {
                warn!(chunk_id = %chunk.id, sequence = chunk.sequence, "Split failed: {}", e);
                let mut failed = chunking.clone();
                failed.fail(ChunkStatus::RetryableFailed, format!("Split failed: {}", e));
                self.ctx.store.transition_chunk(&failed, ChunkStatus::Chunking).await?;
                report.split_failures += 1;
            }
        }
        Ok(())
    }

    /// Publish failures leave the chunk AWAITING_ANALYSIS for a later pass.
    async fn publish_analyze(&self, chunk: &Chunk) -> bool {
        let message = AnalyzeChunk {
            job_id: chunk.job_id.clone(),
            chunk_id: chunk.id.clone(),
        };
        match self.ctx.publisher.publish_analyze(&message).await {
            Ok(_) => true,
            Err(e) => {
                warn!(chunk_id = %chunk.id, "Failed to publish analyze message: {}", e);
                false
            }
        }
    }

    /// Sequential mode: hold the intake message until the job settles.
    async fn wait_for_job(&self, job: &Job) -> WorkerResult<Option<JobStatus>> {
        let deadline = Instant::now() + self.ctx.config.sequential_job_timeout;
        let poll = self.ctx.config.job_poll_interval;

        loop {
            let status = self.ctx.store.get_job(&job.id).await?.map(|j| j.status);
            match status {
                None => return Err(WorkerError::job_failed(format!("job {} disappeared while processing", job.id))),
                Some(s) if s.is_terminal() || s == JobStatus::RetryableFailed => return Ok(Some(s)),
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    job_id = %job.id,
                    timeout_secs = self.ctx.config.sequential_job_timeout.as_secs(),
                    "Sequential wait timed out; releasing intake"
                );
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now).max(Duration::from_millis(1))).await;
        }
    }
}
