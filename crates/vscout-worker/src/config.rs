//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vscout_media::FfmpegChunkSplitter;
use vscout_models::ProcessingMode;

use crate::error::{WorkerError, WorkerResult};

/// Which job/chunk store backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Firestore,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(WorkerError::config_error(format!("unknown JOB_STORE '{}'", other))),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub processing_mode: ProcessingMode,
    /// Processing deadline of a delivered message
    pub ack_deadline: Duration,
    /// Interval for extending message deadlines and touching job heartbeats
    pub heartbeat_interval: Duration,
    /// Concurrent intake handlers in parallel mode
    pub max_concurrent_jobs: usize,
    /// Concurrent chunk handlers
    pub max_concurrent_chunks: usize,
    pub chunk_duration_secs: f64,
    pub chunk_overlap_secs: f64,
    /// ANALYZING chunks allowed per sequence number (parallel mode)
    pub stage_wip_limit: usize,
    pub stale_job_threshold: Duration,
    pub reconcile_interval: Duration,
    /// Publish a fresh intake message for RETRYABLE_FAILED jobs
    pub reconciler_resubmit: bool,
    /// How often sequential-mode intake re-reads its job
    pub job_poll_interval: Duration,
    pub sequential_job_timeout: Duration,
    /// Orchestration passes allowed after RETRYABLE_FAILED
    pub max_job_retries: u32,
    /// Directory for chunk artifacts
    pub work_dir: PathBuf,
    /// FFmpeg is killed when one segment takes longer than this
    pub split_timeout: Duration,
    /// How often the worker scans for abandoned pending messages
    pub claim_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    pub store_backend: StoreBackend,
    /// Prometheus listener port; metrics are not exported when unset
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::Parallel,
            ack_deadline: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_jobs: 2,
            max_concurrent_chunks: 4,
            chunk_duration_secs: 150.0,
            chunk_overlap_secs: 30.0,
            stage_wip_limit: 2,
            stale_job_threshold: Duration::from_secs(1800),
            reconcile_interval: Duration::from_secs(60),
            reconciler_resubmit: true,
            job_poll_interval: Duration::from_secs(5),
            sequential_job_timeout: Duration::from_secs(6 * 3600),
            max_job_retries: 3,
            work_dir: PathBuf::from("/tmp/vscout"),
            split_timeout: Duration::from_secs(600),
            claim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            store_backend: StoreBackend::Firestore,
            metrics_port: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> WorkerResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| WorkerError::config_error(format!("{} has invalid value '{}'", key, raw))),
        _ => Ok(None),
    }
}

fn env_secs(key: &str) -> WorkerResult<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

impl WorkerConfig {
    /// Create config from environment variables, then validate it.
    pub fn from_env() -> WorkerResult<Self> {
        let d = Self::default();

        let processing_mode = match std::env::var("PROCESSING_MODE") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse::<ProcessingMode>()
                .map_err(|e| WorkerError::config_error(e.to_string()))?,
            _ => d.processing_mode,
        };

        let config = Self {
            processing_mode,
            ack_deadline: env_secs("QUEUE_ACK_DEADLINE_SECS")?.unwrap_or(d.ack_deadline),
            heartbeat_interval: env_secs("WORKER_HEARTBEAT_SECS")?.unwrap_or(d.heartbeat_interval),
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS")?.unwrap_or(d.max_concurrent_jobs),
            max_concurrent_chunks: env_parse("WORKER_MAX_CHUNKS")?.unwrap_or(d.max_concurrent_chunks),
            chunk_duration_secs: env_parse("CHUNK_DURATION_SECS")?.unwrap_or(d.chunk_duration_secs),
            chunk_overlap_secs: env_parse("CHUNK_OVERLAP_SECS")?.unwrap_or(d.chunk_overlap_secs),
            stage_wip_limit: env_parse("STAGE_WIP_LIMIT")?.unwrap_or(d.stage_wip_limit),
            stale_job_threshold: env_secs("STALE_JOB_THRESHOLD_SECS")?.unwrap_or(d.stale_job_threshold),
            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS")?.unwrap_or(d.reconcile_interval),
            reconciler_resubmit: env_parse("RECONCILER_RESUBMIT")?.unwrap_or(d.reconciler_resubmit),
            job_poll_interval: env_secs("JOB_POLL_INTERVAL_SECS")?.unwrap_or(d.job_poll_interval),
            sequential_job_timeout: env_secs("SEQUENTIAL_JOB_TIMEOUT_SECS")?.unwrap_or(d.sequential_job_timeout),
            max_job_retries: env_parse("MAX_JOB_RETRIES")?.unwrap_or(d.max_job_retries),
            work_dir: std::env::var("WORKER_WORK_DIR").map(PathBuf::from).unwrap_or(d.work_dir),
            split_timeout: env_secs("SPLIT_TIMEOUT_SECS")?.unwrap_or(d.split_timeout),
            claim_interval: env_secs("WORKER_CLAIM_INTERVAL_SECS")?.unwrap_or(d.claim_interval),
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT")?.unwrap_or(d.shutdown_timeout),
            store_backend: env_parse("JOB_STORE")?.unwrap_or(d.store_backend),
            metrics_port: env_parse("METRICS_PORT")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.chunk_overlap_secs < 0.0 || self.chunk_duration_secs <= self.chunk_overlap_secs {
            return Err(WorkerError::config_error(format!(
                "CHUNK_DURATION_SECS ({}) must exceed CHUNK_OVERLAP_SECS ({})",
                self.chunk_duration_secs, self.chunk_overlap_secs
            )));
        }
        for (name, value) in [
            ("WORKER_MAX_JOBS", self.max_concurrent_jobs),
            ("WORKER_MAX_CHUNKS", self.max_concurrent_chunks),
            ("STAGE_WIP_LIMIT", self.stage_wip_limit),
        ] {
            if value == 0 {
                return Err(WorkerError::config_error(format!("{} must be at least 1", name)));
            }
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.ack_deadline {
            return Err(WorkerError::config_error(format!(
                "WORKER_HEARTBEAT_SECS ({}s) must be non-zero and shorter than QUEUE_ACK_DEADLINE_SECS ({}s)",
                self.heartbeat_interval.as_secs(),
                self.ack_deadline.as_secs()
            )));
        }
        if self.job_poll_interval.is_zero()
            || self.reconcile_interval.is_zero()
            || self.claim_interval.is_zero()
            || self.split_timeout.as_secs() == 0
        {
            return Err(WorkerError::config_error(
                "JOB_POLL_INTERVAL_SECS, RECONCILE_INTERVAL_SECS, WORKER_CLAIM_INTERVAL_SECS and SPLIT_TIMEOUT_SECS must be non-zero",
            ));
        }
        Ok(())
    }

    /// FFmpeg splitter writing under `work_dir`, bounded by `split_timeout`.
    pub fn chunk_splitter(&self) -> FfmpegChunkSplitter {
        FfmpegChunkSplitter::new(&self.work_dir).with_timeout(self.split_timeout.as_secs())
    }

    /// Intake handlers allowed at once. Sequential mode runs one job at a time.
    pub fn intake_permits(&self) -> usize {
        match self.processing_mode {
            ProcessingMode::Sequential => 1,
            ProcessingMode::Parallel => self.max_concurrent_jobs,
        }
    }
}
