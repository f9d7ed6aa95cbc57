//! Firestore request metrics.

use metrics::{counter, histogram};

/// Metric name constants.
pub mod names {
    /// Requests by operation and resulting HTTP status.
    pub const REQUESTS_TOTAL: &str = "vscout_firestore_requests_total";

    /// Retried attempts by operation.
    pub const RETRIES_TOTAL: &str = "vscout_firestore_retries_total";

    /// End-to-end latency (including retries) by operation.
    pub const LATENCY_SECONDS: &str = "vscout_firestore_latency_seconds";

    /// Documents returned by list calls, by collection.
    pub const LIST_DOCUMENTS_RETURNED_TOTAL: &str = "vscout_firestore_list_documents_returned_total";

    /// Per-write batch outcomes (`written`, `already_exists`, `failed`).
    pub const BATCH_WRITE_OUTCOMES_TOTAL: &str = "vscout_firestore_batch_write_outcomes_total";
}

pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation.to_string()).record(latency_ms / 1000.0);
}

pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn record_batch_outcome(outcome: &'static str, count: u64) {
    if count > 0 {
        counter!(names::BATCH_WRITE_OUTCOMES_TOTAL, "outcome" => outcome).increment(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            names::REQUESTS_TOTAL,
            names::RETRIES_TOTAL,
            names::LATENCY_SECONDS,
            names::LIST_DOCUMENTS_RETURNED_TOTAL,
            names::BATCH_WRITE_OUTCOMES_TOTAL,
        ] {
            assert!(name.starts_with("vscout_firestore_"), "{name}");
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("get_document", 200, 12.0);
        record_retry("get_document");
        record_batch_outcome("written", 0);
    }
}
