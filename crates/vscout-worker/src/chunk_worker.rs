//! Analyze-message handling and concurrency gating.
//!
//! A handler never waits for its preconditions: a gated-out message is
//! nacked and comes back later through the transport's delayed redelivery.
//! Once a chunk is claimed, every outcome (including an unexpected error
//! or panic) ends with the chunk recorded, the finalizer invoked and the
//! message acknowledged.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use vscout_ml_client::AnalysisRequest;
use vscout_models::{Chunk, ChunkId, ChunkStatus, Job, ProcessingMode};
use vscout_queue::AnalyzeChunk;

use crate::context::PipelineContext;
use crate::error::WorkerResult;
use crate::events::{process_events, ChunkWindow, EventInput};
use crate::finalizer::Finalizer;
use crate::metrics;

/// A handler's verdict for its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Redeliver later.
    Nack { reason: String },
}

impl Disposition {
    pub fn nack(reason: impl Into<String>) -> Self {
        Disposition::Nack { reason: reason.into() }
    }
}

enum Admission {
    Done(Disposition),
    Claimed {
        job: Job,
        chunk: Chunk,
        previous_token: Option<String>,
    },
}

pub struct ChunkWorker {
    ctx: PipelineContext,
    finalizer: Finalizer,
}

impl ChunkWorker {
    pub fn new(ctx: PipelineContext) -> Self {
        let finalizer = Finalizer::new(ctx.clone());
        Self { ctx, finalizer }
    }

    pub async fn handle(&self, message: &AnalyzeChunk) -> Disposition {
        let admission = match AssertUnwindSafe(self.admit(message)).catch_unwind().await {
            Ok(Ok(admission)) => admission,
            Ok(Err(e)) if e.is_retryable() => {
                warn!(chunk_id = %message.chunk_id, "Transient error before claim: {}", e);
                return Disposition::nack(format!("transient: {}", e));
            }
            Ok(Err(e)) => return self.fail_unexpectedly(message, e.to_string()).await,
            Err(panic) => return self.fail_unexpectedly(message, panic_message(panic)).await,
        };

        let (job, chunk, previous_token) = match admission {
            Admission::Done(disposition) => return disposition,
            Admission::Claimed {
                job,
                chunk,
                previous_token,
            } => (job, chunk, previous_token),
        };

        match AssertUnwindSafe(self.analyze(&job, &chunk, previous_token)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail_unexpectedly(message, e.to_string()).await,
            Err(panic) => return self.fail_unexpectedly(message, panic_message(panic)).await,
        }

        self.finalize(message).await;
        Disposition::Ack
    }

    /// Re-read state, apply the mode's gate and claim the chunk.
    async fn admit(&self, message: &AnalyzeChunk) -> WorkerResult<Admission> {
        let Some(chunk) = self.ctx.store.get_chunk(&message.chunk_id).await? else {
            warn!(chunk_id = %message.chunk_id, "Chunk not found; dropping message");
            return Ok(Admission::Done(Disposition::Ack));
        };
        if chunk.status.is_terminal() {
            debug!(chunk_id = %chunk.id, status = %chunk.status, "Chunk already settled");
            metrics::record_chunk("skipped");
            return Ok(Admission::Done(Disposition::Ack));
        }

        let job = match self.ctx.store.get_job(&chunk.job_id).await? {
            Some(job) if !job.is_terminal() => job,
            _ => {
                debug!(chunk_id = %chunk.id, "Job missing or terminal; dropping message");
                return Ok(Admission::Done(Disposition::Ack));
            }
        };

        match chunk.status {
            ChunkStatus::Pending | ChunkStatus::Chunking => {
                return Ok(Admission::Done(self.gate_nack("artifact_not_ready", &chunk)));
            }
            ChunkStatus::RetryableFailed => {
                debug!(chunk_id = %chunk.id, "Chunk awaits the next planning pass");
                return Ok(Admission::Done(Disposition::Ack));
            }
            _ => {}
        }

        let previous_token = match self.ctx.config.processing_mode {
            ProcessingMode::Sequential => match self.sequential_gate(&chunk).await? {
                Ok(token) => token,
                Err(disposition) => return Ok(Admission::Done(disposition)),
            },
            ProcessingMode::Parallel => {
                let others = self
                    .ctx
                    .store
                    .list_stage(chunk.sequence, ChunkStatus::Analyzing)
                    .await?
                    .into_iter()
                    .filter(|c| c.id != chunk.id)
                    .count();
                if others >= self.ctx.config.stage_wip_limit {
                    return Ok(Admission::Done(self.gate_nack("stage_full", &chunk)));
                }
                None
            }
        };

        let mut claimed = chunk.clone();
        claimed.set_status(ChunkStatus::Analyzing);
        if !self.ctx.store.transition_chunk(&claimed, chunk.status).await? {
            debug!(chunk_id = %chunk.id, "Chunk claimed elsewhere");
            return Ok(Admission::Done(Disposition::Ack));
        }

        if self.ctx.config.processing_mode == ProcessingMode::Parallel && !self.holds_stage_slot(&claimed).await? {
            let mut reverted = claimed.clone();
            reverted.set_status(ChunkStatus::AwaitingAnalysis);
            reverted.analysis_started_at = None;
            self.ctx.store.transition_chunk(&reverted, ChunkStatus::Analyzing).await?;
            return Ok(Admission::Done(self.gate_nack("stage_race", &chunk)));
        }

        self.ctx.store.touch_job_heartbeat(&job.id).await?;
        Ok(Admission::Claimed {
            job,
            chunk: claimed,
            previous_token,
        })
    }

    /// `Ok(token)` when the previous chunk is COMPLETED (or there is none).
    async fn sequential_gate(&self, chunk: &Chunk) -> WorkerResult<Result<Option<String>, Disposition>> {
        if chunk.sequence == 0 {
            return Ok(Ok(None));
        }
        let previous_id = ChunkId::for_sequence(&chunk.job_id, chunk.sequence - 1);
        let Some(previous) = self.ctx.store.get_chunk(&previous_id).await? else {
            return Ok(Err(self.gate_nack("previous_missing", chunk)));
        };
        match previous.status {
            ChunkStatus::Completed => Ok(Ok(previous.continuation_token)),
            ChunkStatus::Failed => {
                info!(
                    chunk_id = %chunk.id,
                    previous = %previous.id,
                    "Previous chunk failed; finalizing job"
                );
                if let Err(e) = self.finalizer.finalize(&chunk.job_id).await {
                    warn!(job_id = %chunk.job_id, "Finalize after previous failure errored: {}", e);
                }
                Ok(Err(Disposition::Ack))
            }
            _ => Ok(Err(self.gate_nack("previous_incomplete", chunk))),
        }
    }

    /// Rank the stage's ANALYZING chunks by (analysis start, id); only the
    /// first `stage_wip_limit` keep their claim.
    async fn holds_stage_slot(&self, claimed: &Chunk) -> WorkerResult<bool> {
        let mut stage = self
            .ctx
            .store
            .list_stage(claimed.sequence, ChunkStatus::Analyzing)
            .await?;
        stage.sort_by(|a, b| {
            a.analysis_started_at
                .cmp(&b.analysis_started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(match stage.iter().position(|c| c.id == claimed.id) {
            Some(rank) => rank < self.ctx.config.stage_wip_limit,
            None => true,
        })
    }

    fn gate_nack(&self, reason: &'static str, chunk: &Chunk) -> Disposition {
        debug!(chunk_id = %chunk.id, sequence = chunk.sequence, reason, "Gate closed; nacking");
        metrics::record_gate_nack(reason);
        Disposition::nack(reason)
    }

    /// Call the analysis service and persist its outcome on the chunk.
    async fn analyze(&self, job: &Job, chunk: &Chunk, previous_token: Option<String>) -> WorkerResult<()> {
        let known = self.ctx.store.list_entities(&job.id).await?;
        let request = AnalysisRequest {
            artifact_path: chunk.artifact_path.clone(),
            chunk_sequence: chunk.sequence,
            known_entities: known.clone(),
            continuation_token: previous_token,
        };

        let started = Instant::now();
        let response = self.ctx.analysis.analyze(&request).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match response {
            Ok(response) => {
                metrics::record_analysis_duration("ok", elapsed);
                response
            }
            Err(e) => {
                metrics::record_analysis_duration("error", elapsed);
                let status = if e.is_retryable() {
                    ChunkStatus::RetryableFailed
                } else {
                    ChunkStatus::Failed
                };
                warn!(chunk_id = %chunk.id, status = %status, "Analysis failed: {}", e);
                let mut failed = chunk.clone();
                failed.fail(status, format!("Analysis failed: {}", e));
                self.ctx.store.transition_chunk(&failed, ChunkStatus::Analyzing).await?;
                metrics::record_chunk(status.as_str());
                return Ok(());
            }
        };

        let mut seen: HashSet<String> = self
            .ctx
            .store
            .list_events(&job.id)
            .await?
            .into_iter()
            .map(|e| e.dedup_key)
            .collect();
        let mut known: HashMap<String, _> = known.into_iter().map(|e| (e.id.clone(), e)).collect();

        let batch = process_events(EventInput {
            job_id: &job.id,
            window: ChunkWindow {
                sequence: chunk.sequence,
                start_secs: chunk.start_secs,
                duration_secs: chunk.duration_secs,
                overlap_secs: self.ctx.config.chunk_overlap_secs,
            },
            raw_events: &response.events,
            seen_keys: &mut seen,
            known_entities: &mut known,
        });
        metrics::record_events(batch.events.len(), batch.duplicates, batch.unknown_type, batch.errors);

        self.ctx.store.insert_entities(&job.id, &batch.new_entities).await?;
        let written = self.ctx.store.append_events(&job.id, &batch.events).await?;

        let mut completed = chunk.clone();
        completed.continuation_token = response.continuation_token;
        completed.raw_response = Some(response.raw_response);
        completed.set_status(ChunkStatus::Completed);
        if !self.ctx.store.transition_chunk(&completed, ChunkStatus::Analyzing).await? {
            warn!(chunk_id = %chunk.id, "Chunk changed during analysis; completion not recorded");
            return Ok(());
        }
        metrics::record_chunk("completed");
        info!(
            job_id = %job.id,
            chunk_id = %chunk.id,
            sequence = chunk.sequence,
            accepted = written,
            dropped = batch.dropped(),
            new_entities = batch.new_entities.len(),
            "Chunk analyzed"
        );
        Ok(())
    }

    /// Record an unexpected failure on the chunk, then finalize and ack.
    async fn fail_unexpectedly(&self, message: &AnalyzeChunk, reason: String) -> Disposition {
        error!(chunk_id = %message.chunk_id, "Unexpected error while handling chunk: {}", reason);
        if let Err(e) = self.record_failure(&message.chunk_id, &reason).await {
            error!(chunk_id = %message.chunk_id, "Could not record chunk failure: {}", e);
        }
        metrics::record_chunk(ChunkStatus::Failed.as_str());
        self.finalize(message).await;
        Disposition::Ack
    }

    async fn record_failure(&self, chunk_id: &ChunkId, reason: &str) -> WorkerResult<()> {
        let Some(chunk) = self.ctx.store.get_chunk(chunk_id).await? else {
            return Ok(());
        };
        if chunk.status.is_terminal() || !chunk.status.can_transition_to(ChunkStatus::Failed) {
            return Ok(());
        }
        let mut failed = chunk.clone();
        failed.fail(ChunkStatus::Failed, format!("Unexpected error: {}", reason));
        self.ctx.store.transition_chunk(&failed, chunk.status).await?;
        Ok(())
    }

    async fn finalize(&self, message: &AnalyzeChunk) {
        if let Err(e) = self.finalizer.finalize(&message.job_id).await {
            warn!(job_id = %message.job_id, "Finalize failed: {}", e);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => s.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    };
    format!("panic: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_payload() {
        assert_eq!(panic_message(Box::new("boom")), "panic: boom");
        assert_eq!(panic_message(Box::new(String::from("bad index"))), "panic: bad index");
        assert_eq!(panic_message(Box::new(42u8)), "panic: unknown panic");
    }

    #[test]
    fn test_nack_carries_reason() {
        assert_eq!(
            Disposition::nack("stage_full"),
            Disposition::Nack {
                reason: "stage_full".into()
            }
        );
    }
}
