//! Pipeline metrics.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    /// Chunk handling outcomes (`completed`, `failed`, `retryable_failed`, `skipped`).
    pub const CHUNKS_TOTAL: &str = "vscout_chunks_total";
    /// Analyze messages nacked by a gate, by reason.
    pub const GATE_NACKS_TOTAL: &str = "vscout_gate_nacks_total";
    /// Terminal job transitions won by this worker, by status.
    pub const JOBS_FINALIZED_TOTAL: &str = "vscout_jobs_finalized_total";
    pub const EVENTS_ACCEPTED_TOTAL: &str = "vscout_events_accepted_total";
    /// Raw events dropped by the event processor, by reason.
    pub const EVENTS_DROPPED_TOTAL: &str = "vscout_events_dropped_total";
    pub const JOBS_DEMOTED_TOTAL: &str = "vscout_jobs_demoted_total";
    /// Wall time of analysis calls, by outcome.
    pub const ANALYSIS_DURATION_SECONDS: &str = "vscout_analysis_duration_seconds";
    /// Recorded by the analysis client itself, unlabeled.
    pub const ML_TASK_DURATION_SECONDS: &str = vscout_ml_client::TASK_DURATION_SECONDS;
    pub const QUEUE_LENGTH: &str = "vscout_queue_length";
    pub const QUEUE_DLQ_LENGTH: &str = "vscout_queue_dlq_length";
    pub const QUEUE_DELAYED_LENGTH: &str = "vscout_queue_delayed_length";
}

/// Install the Prometheus recorder with an HTTP listener on `port`.
/// Must be called from within a tokio runtime.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| WorkerError::config_error(format!("failed to start metrics listener: {}", e)))
}

pub fn record_chunk(outcome: &'static str) {
    counter!(names::CHUNKS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_gate_nack(reason: &'static str) {
    counter!(names::GATE_NACKS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_job_finalized(status: &'static str) {
    counter!(names::JOBS_FINALIZED_TOTAL, "status" => status).increment(1);
}

pub fn record_events(accepted: usize, duplicates: usize, unknown_type: usize, errors: usize) {
    counter!(names::EVENTS_ACCEPTED_TOTAL).increment(accepted as u64);
    for (reason, count) in [("duplicate", duplicates), ("unknown_type", unknown_type), ("error", errors)] {
        if count > 0 {
            counter!(names::EVENTS_DROPPED_TOTAL, "reason" => reason).increment(count as u64);
        }
    }
}

pub fn record_analysis_duration(outcome: &'static str, seconds: f64) {
    histogram!(names::ANALYSIS_DURATION_SECONDS, "outcome" => outcome).record(seconds);
}

pub fn record_job_demoted() {
    counter!(names::JOBS_DEMOTED_TOTAL).increment(1);
}

pub fn set_queue_depths(channel: &'static str, length: u64, dlq: u64, delayed: u64) {
    gauge!(names::QUEUE_LENGTH, "channel" => channel).set(length as f64);
    gauge!(names::QUEUE_DLQ_LENGTH).set(dlq as f64);
    gauge!(names::QUEUE_DELAYED_LENGTH).set(delayed as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_namespaced() {
        for name in [
            names::CHUNKS_TOTAL,
            names::GATE_NACKS_TOTAL,
            names::JOBS_FINALIZED_TOTAL,
            names::EVENTS_ACCEPTED_TOTAL,
            names::EVENTS_DROPPED_TOTAL,
            names::JOBS_DEMOTED_TOTAL,
            names::ANALYSIS_DURATION_SECONDS,
            names::ML_TASK_DURATION_SECONDS,
            names::QUEUE_LENGTH,
            names::QUEUE_DLQ_LENGTH,
            names::QUEUE_DELAYED_LENGTH,
        ] {
            assert!(name.starts_with("vscout_"));
        }
    }

    #[test]
    fn test_client_histogram_is_its_own_family() {
        // labeled and unlabeled samples must not share a Prometheus family
        assert_ne!(names::ANALYSIS_DURATION_SECONDS, names::ML_TASK_DURATION_SECONDS);
    }

    #[test]
    fn test_recording_without_recorder() {
        record_chunk("completed");
        record_gate_nack("stage_full");
        record_events(3, 1, 0, 0);
    }
}
