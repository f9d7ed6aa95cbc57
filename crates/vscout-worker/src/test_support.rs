//! In-process fakes for pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vscout_media::{ChunkSplitter, MediaError, MediaResult, SplitRequest};
use vscout_ml_client::{AnalysisClient, AnalysisRequest, AnalysisResponse, MlError, MlResult};
use vscout_models::{
    Chunk, ChunkId, ChunkStatus, IdentifiedEntity, Job, JobId, JobStatus, ProcessedEvent, ProcessingMode, RawEvent,
};
use vscout_queue::{AnalyzeChunk, JobResult, MessagePublisher, QueueError, QueueResult, SubmitVideo};

use crate::config::{StoreBackend, WorkerConfig};
use crate::context::PipelineContext;
use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, MemoryJobStore};

/// What the fake analysis service does for one call.
pub enum Script {
    Events(Vec<RawEvent>),
    Fail(MlError),
    Panic,
}

/// Analysis client answering from per-sequence scripts. Unscripted calls
/// return no events. Optionally inspects the store on every call to check
/// gating invariants while a chunk is being analyzed.
#[derive(Default)]
pub struct ScriptedAnalysis {
    scripts: Mutex<HashMap<u32, VecDeque<Script>>>,
    pub requests: Mutex<Vec<AnalysisRequest>>,
    observed_store: Mutex<Option<Arc<MemoryJobStore>>>,
    pub delay: Mutex<Option<Duration>>,
    in_flight: Mutex<HashMap<u32, usize>>,
    /// Most analysis calls seen running at once for one sequence number
    pub max_in_flight_per_stage: AtomicUsize,
    /// Calls made while an earlier chunk of the same job was not COMPLETED
    pub order_violations: AtomicUsize,
}

impl ScriptedAnalysis {
    pub fn script(&self, sequence: u32, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(sequence)
            .or_default()
            .push_back(script);
    }

    pub fn observe(&self, store: Arc<MemoryJobStore>) {
        *self.observed_store.lock().unwrap() = Some(store);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    async fn check_invariants(&self, sequence: u32) {
        let store = self.observed_store.lock().unwrap().clone();
        let Some(store) = store else { return };

        let stage = store.list_stage(sequence, ChunkStatus::Analyzing).await.unwrap();

        for chunk in stage {
            if chunk.sequence == 0 {
                continue;
            }
            let chunks = store.list_chunks(&chunk.job_id).await.unwrap();
            let previous_done = chunks
                .iter()
                .filter(|c| c.sequence < chunk.sequence)
                .all(|c| c.status == ChunkStatus::Completed);
            if !previous_done {
                self.order_violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl AnalysisClient for ScriptedAnalysis {
    async fn analyze(&self, request: &AnalysisRequest) -> MlResult<AnalysisResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let sequence = request.chunk_sequence;
        let running = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let running = in_flight.entry(sequence).or_default();
            *running += 1;
            *running
        };
        self.max_in_flight_per_stage.fetch_max(running, Ordering::SeqCst);
        self.check_invariants(sequence).await;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(running) = self.in_flight.lock().unwrap().get_mut(&sequence) {
            *running -= 1;
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.chunk_sequence)
            .and_then(|queue| queue.pop_front());
        match script {
            None => Ok(response(Vec::new(), request.chunk_sequence)),
            Some(Script::Events(events)) => Ok(response(events, request.chunk_sequence)),
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Panic) => panic!("analysis exploded"),
        }
    }
}

fn response(events: Vec<RawEvent>, sequence: u32) -> AnalysisResponse {
    AnalysisResponse {
        events,
        continuation_token: Some(format!("token-after-{}", sequence)),
        raw_response: format!("{{\"chunk\":{}}}", sequence),
    }
}

/// Publisher that records messages instead of sending them.
#[derive(Default)]
pub struct RecordingPublisher {
    pub submits: Mutex<Vec<SubmitVideo>>,
    pub analyzes: Mutex<Vec<AnalyzeChunk>>,
    pub results: Mutex<Vec<JobResult>>,
    pub fail_analyze: AtomicBool,
}

impl RecordingPublisher {
    pub fn take_analyzes(&self) -> Vec<AnalyzeChunk> {
        std::mem::take(&mut *self.analyzes.lock().unwrap())
    }

    pub fn results(&self) -> Vec<JobResult> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish_submit(&self, message: &SubmitVideo) -> QueueResult<String> {
        self.submits.lock().unwrap().push(message.clone());
        Ok("0-1".into())
    }

    async fn publish_analyze(&self, message: &AnalyzeChunk) -> QueueResult<String> {
        if self.fail_analyze.load(Ordering::SeqCst) {
            return Err(QueueError::publish_failed("transport down"));
        }
        self.analyzes.lock().unwrap().push(message.clone());
        Ok("0-2".into())
    }

    async fn publish_result(&self, message: &JobResult) -> QueueResult<String> {
        self.results.lock().unwrap().push(message.clone());
        Ok("0-3".into())
    }
}

/// Splitter writing empty files into a temp directory.
pub struct FakeSplitter {
    dir: TempDir,
    pub duration: Mutex<f64>,
    pub failing: Mutex<HashSet<u32>>,
    pub splits: AtomicUsize,
}

impl FakeSplitter {
    pub fn new(duration: f64) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            duration: Mutex::new(duration),
            failing: Mutex::new(HashSet::new()),
            splits: AtomicUsize::new(0),
        }
    }

    pub fn fail_sequence(&self, sequence: u32) {
        self.failing.lock().unwrap().insert(sequence);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChunkSplitter for FakeSplitter {
    async fn probe_duration(&self, _source_path: &str) -> MediaResult<f64> {
        Ok(*self.duration.lock().unwrap())
    }

    async fn split(&self, request: &SplitRequest) -> MediaResult<PathBuf> {
        if self.failing.lock().unwrap().contains(&request.sequence) {
            return Err(MediaError::ffmpeg_failed("segment copy failed", None, Some(1)));
        }
        self.splits.fetch_add(1, Ordering::SeqCst);
        let dir = self.dir.path().join(request.job_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("chunk_{:05}.mp4", request.sequence));
        tokio::fs::write(&path, b"").await?;
        Ok(path)
    }
}

/// A wired pipeline over fakes.
/// Store whose next `conflicts` chunk transitions fail the way a
/// contended Firestore read-modify-write does.
pub struct ContendedStore {
    inner: Arc<MemoryJobStore>,
    pub conflicts: AtomicUsize,
}

impl ContendedStore {
    pub fn new(inner: Arc<MemoryJobStore>, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(conflicts),
        }
    }
}

#[async_trait]
impl JobStore for ContendedStore {
    async fn create_job(&self, job: &Job) -> StoreResult<bool> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> StoreResult<bool> {
        self.inner.transition_job(job, expected).await
    }

    async fn touch_job_heartbeat(&self, job_id: &JobId) -> StoreResult<()> {
        self.inner.touch_job_heartbeat(job_id).await
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        self.inner.list_jobs_by_status(statuses).await
    }

    async fn create_chunk(&self, chunk: &Chunk) -> StoreResult<bool> {
        self.inner.create_chunk(chunk).await
    }

    async fn get_chunk(&self, chunk_id: &ChunkId) -> StoreResult<Option<Chunk>> {
        self.inner.get_chunk(chunk_id).await
    }

    async fn transition_chunk(&self, chunk: &Chunk, expected: ChunkStatus) -> StoreResult<bool> {
        let contended = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if contended {
            return Err(StoreError::conflict(format!("chunk {} kept changing during update", chunk.id)));
        }
        self.inner.transition_chunk(chunk, expected).await
    }

    async fn list_chunks(&self, job_id: &JobId) -> StoreResult<Vec<Chunk>> {
        self.inner.list_chunks(job_id).await
    }

    async fn list_stage(&self, sequence: u32, status: ChunkStatus) -> StoreResult<Vec<Chunk>> {
        self.inner.list_stage(sequence, status).await
    }

    async fn append_events(&self, job_id: &JobId, events: &[ProcessedEvent]) -> StoreResult<usize> {
        self.inner.append_events(job_id, events).await
    }

    async fn list_events(&self, job_id: &JobId) -> StoreResult<Vec<ProcessedEvent>> {
        self.inner.list_events(job_id).await
    }

    async fn insert_entities(&self, job_id: &JobId, entities: &[IdentifiedEntity]) -> StoreResult<usize> {
        self.inner.insert_entities(job_id, entities).await
    }

    async fn list_entities(&self, job_id: &JobId) -> StoreResult<Vec<IdentifiedEntity>> {
        self.inner.list_entities(job_id).await
    }
}

pub struct Harness {
    pub ctx: PipelineContext,
    pub store: Arc<MemoryJobStore>,
    pub analysis: Arc<ScriptedAnalysis>,
    pub publisher: Arc<RecordingPublisher>,
    pub splitter: Arc<FakeSplitter>,
}

pub fn test_config(mode: ProcessingMode) -> WorkerConfig {
    WorkerConfig {
        processing_mode: mode,
        job_poll_interval: Duration::from_millis(10),
        sequential_job_timeout: Duration::from_secs(5),
        store_backend: StoreBackend::Memory,
        ..WorkerConfig::default()
    }
}

impl Harness {
    pub fn new(config: WorkerConfig, duration: f64) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let analysis = Arc::new(ScriptedAnalysis::default());
        analysis.observe(Arc::clone(&store));
        let publisher = Arc::new(RecordingPublisher::default());
        let splitter = Arc::new(FakeSplitter::new(duration));

        let ctx = PipelineContext::new(
            config,
            store.clone(),
            splitter.clone(),
            analysis.clone(),
            publisher.clone(),
        );
        Self {
            ctx,
            store,
            analysis,
            publisher,
            splitter,
        }
    }

    pub async fn job_status(&self, submit: &SubmitVideo) -> Option<JobStatus> {
        self.store.get_job(&submit.job_id()).await.unwrap().map(|j| j.status)
    }

    pub async fn chunk_statuses(&self, submit: &SubmitVideo) -> Vec<ChunkStatus> {
        self.store
            .list_chunks(&submit.job_id())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.status)
            .collect()
    }
}

pub fn submit_request(video: &str) -> SubmitVideo {
    SubmitVideo::new(video.into(), format!("/videos/{}.mp4", video), "user-1")
}

pub fn raw_event(event_type: &str, timestamp: &str, color: &str, jersey: &str) -> RawEvent {
    RawEvent {
        event_type: event_type.into(),
        timestamp: timestamp.into(),
        team_side: Some("home".into()),
        jersey_color: Some(color.into()),
        jersey_number: Some(jersey.into()),
        ..Default::default()
    }
}
