//! Message executor: consumer loops, crash recovery and background sweeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vscout_models::JobId;
use vscout_queue::{
    AnalyzeChunk, Channel, Delivery, MessageQueue, NackOutcome, QueueMessage, QueueResult, SubmitVideo,
};

use crate::chunk_worker::{ChunkWorker, Disposition};
use crate::context::PipelineContext;
use crate::error::{StoreError, WorkerError, WorkerResult};
use crate::heartbeat::with_heartbeat;
use crate::metrics;
use crate::orchestrator::{Orchestrator, SubmitOutcome};
use crate::reconciler::Reconciler;
use crate::retry::{loop_backoff, FailureTracker};

/// How often due nacked messages are moved back onto their stream.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);
const PROMOTE_BATCH: usize = 100;
/// Largest batch read from a stream at once.
const MAX_BATCH: usize = 10;
const MAX_LOOP_BACKOFF: Duration = Duration::from_secs(5);

/// Acknowledgement side of the transport.
#[async_trait]
pub(crate) trait Settle: Send + Sync {
    async fn ack(&self, channel: Channel, message_id: &str) -> QueueResult<()>;

    async fn nack<M: QueueMessage>(&self, delivery: &Delivery<M>, reason: &str) -> QueueResult<NackOutcome>;
}

#[async_trait]
impl Settle for MessageQueue {
    async fn ack(&self, channel: Channel, message_id: &str) -> QueueResult<()> {
        MessageQueue::ack(self, channel, message_id).await
    }

    async fn nack<M: QueueMessage>(&self, delivery: &Delivery<M>, reason: &str) -> QueueResult<NackOutcome> {
        MessageQueue::nack(self, delivery, reason).await
    }
}

/// Apply a handler's disposition to its delivery. Transport failures are
/// logged; the pending entry is then reclaimed by the claim sweep.
pub(crate) async fn settle<S: Settle, M: QueueMessage>(transport: &S, delivery: &Delivery<M>, disposition: Disposition) {
    let channel = delivery.channel();
    match disposition {
        Disposition::Ack => {
            if let Err(e) = transport.ack(channel, &delivery.message_id).await {
                error!(message_id = %delivery.message_id, %channel, "Failed to ack message: {}", e);
            }
        }
        Disposition::Nack { reason } => match transport.nack(delivery, &reason).await {
            Ok(NackOutcome::Delayed(delay)) => {
                debug!(message_id = %delivery.message_id, %channel, delay_ms = delay.as_millis() as u64, %reason, "Nacked message")
            }
            Ok(NackOutcome::DeadLettered) => {
                warn!(message_id = %delivery.message_id, %channel, %reason, "Message dead-lettered after repeated nacks")
            }
            Err(e) => error!(message_id = %delivery.message_id, %channel, "Failed to nack message: {}", e),
        },
    }
}

/// Retryable intake errors are redelivered; anything else is acked so a
/// poison submission cannot loop.
pub(crate) fn intake_disposition(job_id: &JobId, result: WorkerResult<SubmitOutcome>) -> Disposition {
    match result {
        Ok(outcome) => {
            match outcome {
                SubmitOutcome::AlreadyTerminal(status) => debug!(job_id = %job_id, %status, "Intake for terminal job"),
                SubmitOutcome::RetriesExhausted => warn!(job_id = %job_id, "Job failed after exhausting retries"),
                SubmitOutcome::Planned { report, finalized, settled } => {
                    info!(job_id = %job_id, ?report, ?finalized, ?settled, "Intake complete")
                }
            }
            Disposition::Ack
        }
        Err(e) if e.is_retryable() => {
            warn!(job_id = %job_id, "Intake failed, will retry: {}", e);
            Disposition::nack(e.to_string())
        }
        Err(e) => {
            error!(job_id = %job_id, "Intake failed permanently: {}", e);
            Disposition::Ack
        }
    }
}

/// Runs the pipeline against the Redis transport.
pub struct PipelineExecutor {
    ctx: PipelineContext,
    queue: Arc<MessageQueue>,
    orchestrator: Arc<Orchestrator>,
    chunk_worker: Arc<ChunkWorker>,
    reconciler: Arc<Reconciler>,
    intake_permits: Arc<Semaphore>,
    chunk_permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl PipelineExecutor {
    pub fn new(ctx: PipelineContext, queue: Arc<MessageQueue>) -> Self {
        let intake_permits = Arc::new(Semaphore::new(ctx.config.intake_permits()));
        let chunk_permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_chunks));
        let (shutdown, _) = watch::channel(false);

        Self {
            orchestrator: Arc::new(Orchestrator::new(ctx.clone())),
            chunk_worker: Arc::new(ChunkWorker::new(ctx.clone())),
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            ctx,
            queue,
            intake_permits,
            chunk_permits,
            shutdown,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`shutdown`](Self::shutdown) is signalled, then drain.
    pub async fn run(self: Arc<Self>) -> WorkerResult<()> {
        info!(
            consumer = %self.consumer_name,
            mode = %self.ctx.config.processing_mode,
            intake_permits = self.ctx.config.intake_permits(),
            chunk_permits = self.ctx.config.max_concurrent_chunks,
            "Starting pipeline executor"
        );

        self.queue.init().await?;

        match self.reconciler.run_once().await {
            Ok(report) => info!(?report, "Startup reconciliation complete"),
            Err(e) => warn!("Startup reconciliation failed: {}", e),
        }

        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&self).intake_loop()),
            tokio::spawn(Arc::clone(&self).analyze_loop()),
            tokio::spawn(Arc::clone(&self).claim_loop()),
            tokio::spawn(Arc::clone(&self).promote_loop()),
            tokio::spawn(Arc::clone(&self).reconcile_loop()),
        ];

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        info!("Shutdown signal received, stopping executor");

        for task in &tasks {
            task.abort();
        }

        info!("Waiting for in-flight messages to complete...");
        let drained = tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_handlers()).await;
        if drained.is_err() {
            warn!(
                timeout_secs = self.ctx.config.shutdown_timeout.as_secs(),
                "In-flight handlers still running at shutdown; their messages will be reclaimed"
            );
        }

        info!("Pipeline executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn wait_for_handlers(&self) {
        let intake = self.ctx.config.intake_permits() as u32;
        let chunks = self.ctx.config.max_concurrent_chunks as u32;
        let _intake = self.intake_permits.acquire_many(intake).await;
        let _chunks = self.chunk_permits.acquire_many(chunks).await;
    }

    async fn intake_loop(self: Arc<Self>) {
        let mut failures = FailureTracker::new("intake consumer", 3);
        loop {
            match self.next_batch::<SubmitVideo>(&self.intake_permits).await {
                Ok(batch) => {
                    failures.record_success();
                    for (delivery, permit) in batch {
                        tokio::spawn(Arc::clone(&self).execute_intake(delivery, permit));
                    }
                }
                Err(e) => self.back_off(&mut failures, "intake", e).await,
            }
        }
    }

    async fn analyze_loop(self: Arc<Self>) {
        let mut failures = FailureTracker::new("analyze consumer", 3);
        loop {
            match self.next_batch::<AnalyzeChunk>(&self.chunk_permits).await {
                Ok(batch) => {
                    failures.record_success();
                    for (delivery, permit) in batch {
                        tokio::spawn(Arc::clone(&self).execute_analyze(delivery, permit));
                    }
                }
                Err(e) => self.back_off(&mut failures, "analyze", e).await,
            }
        }
    }

    async fn back_off(&self, failures: &mut FailureTracker, channel: &'static str, e: WorkerError) {
        if failures.record_failure() {
            error!(channel, "Error consuming messages: {}", e);
        }
        tokio::time::sleep(loop_backoff(failures.failure_count(), MAX_LOOP_BACKOFF)).await;
    }

    /// Read as many messages as there are free permits, pairing each with
    /// its permit.
    async fn next_batch<M: QueueMessage>(
        &self,
        permits: &Arc<Semaphore>,
    ) -> WorkerResult<Vec<(Delivery<M>, OwnedSemaphorePermit)>> {
        let available = permits.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(Vec::new());
        }

        let deliveries = self
            .queue
            .consume::<M>(&self.consumer_name, available.min(MAX_BATCH))
            .await?;
        if !deliveries.is_empty() {
            debug!(channel = %M::CHANNEL, count = deliveries.len(), "Consumed messages");
        }
        self.with_permits(deliveries, permits).await
    }

    async fn with_permits<M>(
        &self,
        deliveries: Vec<Delivery<M>>,
        permits: &Arc<Semaphore>,
    ) -> WorkerResult<Vec<(Delivery<M>, OwnedSemaphorePermit)>> {
        let mut batch = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let permit = Arc::clone(permits)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            batch.push((delivery, permit));
        }
        Ok(batch)
    }

    async fn execute_intake(self: Arc<Self>, delivery: Delivery<SubmitVideo>, _permit: OwnedSemaphorePermit) {
        let job_id = delivery.message.job_id();
        info!(job_id = %job_id, attempt = delivery.attempt, "Executing {}", delivery.message.describe());

        let queue = Arc::clone(&self.queue);
        let consumer = self.consumer_name.clone();
        let message_id = delivery.message_id.clone();
        let result = with_heartbeat(
            self.orchestrator.submit(&delivery.message),
            self.ctx.config.heartbeat_interval,
            "intake heartbeat",
            move || {
                let queue = Arc::clone(&queue);
                let consumer = consumer.clone();
                let message_id = message_id.clone();
                async move { Ok(queue.extend_deadline(Channel::Intake, &consumer, &message_id).await?) }
            },
        )
        .await;

        let disposition = intake_disposition(&job_id, result);
        settle(self.queue.as_ref(), &delivery, disposition).await;
    }

    async fn execute_analyze(self: Arc<Self>, delivery: Delivery<AnalyzeChunk>, _permit: OwnedSemaphorePermit) {
        let message = delivery.message.clone();
        debug!(chunk_id = %message.chunk_id, attempt = delivery.attempt, "Executing {}", message.describe());

        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.ctx.store);
        let consumer = self.consumer_name.clone();
        let message_id = delivery.message_id.clone();
        let job_id = message.job_id.clone();
        let disposition = with_heartbeat(
            self.chunk_worker.handle(&message),
            self.ctx.config.heartbeat_interval,
            "chunk heartbeat",
            move || {
                let queue = Arc::clone(&queue);
                let store = Arc::clone(&store);
                let consumer = consumer.clone();
                let message_id = message_id.clone();
                let job_id = job_id.clone();
                async move {
                    queue.extend_deadline(Channel::Analyze, &consumer, &message_id).await?;
                    match store.touch_job_heartbeat(&job_id).await {
                        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                }
            },
        )
        .await;

        settle(self.queue.as_ref(), &delivery, disposition).await;
    }

    /// Reclaim messages whose consumer died, and refresh queue gauges.
    async fn claim_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config.claim_interval);
        let mut failures = FailureTracker::new("pending claim", 3);
        loop {
            ticker.tick().await;
            match self.claim_once().await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to claim pending messages: {}", e);
                    }
                }
            }
            self.report_depths().await;
        }
    }

    async fn claim_once(self: &Arc<Self>) -> WorkerResult<()> {
        let intake = self
            .queue
            .claim_pending::<SubmitVideo>(&self.consumer_name, self.ctx.config.intake_permits())
            .await?;
        let chunks = self
            .queue
            .claim_pending::<AnalyzeChunk>(&self.consumer_name, self.ctx.config.max_concurrent_chunks)
            .await?;
        if intake.is_empty() && chunks.is_empty() {
            return Ok(());
        }
        info!(intake = intake.len(), analyze = chunks.len(), "Claimed abandoned messages");

        // Claimed handlers wait for a permit in their own task so the
        // sweep never blocks behind busy consumers.
        for delivery in intake {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(permit) = Arc::clone(&this.intake_permits).acquire_owned().await {
                    this.execute_intake(delivery, permit).await;
                }
            });
        }
        for delivery in chunks {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(permit) = Arc::clone(&this.chunk_permits).acquire_owned().await {
                    this.execute_analyze(delivery, permit).await;
                }
            });
        }
        Ok(())
    }

    async fn report_depths(&self) {
        let dlq = self.queue.dlq_len().await.unwrap_or_default();
        let delayed = self.queue.delayed_len().await.unwrap_or_default();
        for channel in [Channel::Intake, Channel::Analyze, Channel::Results] {
            if let Ok(length) = self.queue.len(channel).await {
                metrics::set_queue_depths(channel.name(), length, dlq, delayed);
            }
        }
    }

    async fn promote_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PROMOTE_INTERVAL);
        let mut failures = FailureTracker::new("delayed promoter", 3);
        loop {
            ticker.tick().await;
            match self.queue.promote_delayed(PROMOTE_BATCH).await {
                Ok(promoted) => {
                    failures.record_success();
                    if promoted > 0 {
                        debug!(promoted, "Promoted delayed messages");
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to promote delayed messages: {}", e);
                    }
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config.reconcile_interval);
        // the first tick fires immediately; startup already reconciled
        ticker.tick().await;
        let mut failures = FailureTracker::new("reconciler", 3);
        loop {
            ticker.tick().await;
            match self.reconciler.run_once().await {
                Ok(_) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Reconciler sweep failed: {}", e);
                    }
                }
            }
        }
    }
}
