//! Failure bookkeeping for long-running background loops.
//!
//! Heartbeats, claim sweeps and the reconciler run forever; when their
//! backing service is down they would log on every tick. `FailureTracker`
//! caps that noise, and `loop_backoff` spaces out consumer-loop retries.

use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the next consume attempt after `consecutive_failures`
/// failed reads: 100ms doubling up to `max`.
pub fn loop_backoff(consecutive_failures: u32, max: Duration) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    Duration::from_millis(100u64 << exp).min(max)
}

/// Counts consecutive failures of a background loop and decides which
/// ones are worth logging.
#[derive(Debug)]
pub struct FailureTracker {
    label: &'static str,
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(label: &'static str, max_logged_failures: u32) -> Self {
        Self {
            label,
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    pub fn record_success(&mut self) {
        if self.suppressed {
            debug!(
                task = self.label,
                failures = self.consecutive_failures,
                "Recovered after consecutive failures"
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Returns `true` if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else {
            if !self.suppressed {
                self.suppressed = true;
                warn!(
                    task = self.label,
                    "Suppressing further failure logs after {} consecutive failures",
                    self.max_logged_failures
                );
            }
            false
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_backoff_grows_and_caps() {
        let max = Duration::from_secs(5);
        assert_eq!(loop_backoff(1, max), Duration::from_millis(100));
        assert_eq!(loop_backoff(2, max), Duration::from_millis(200));
        assert_eq!(loop_backoff(4, max), Duration::from_millis(800));
        assert_eq!(loop_backoff(40, max), max);
    }

    #[test]
    fn test_failure_tracker_suppression() {
        let mut tracker = FailureTracker::new("heartbeat", 2);

        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        // third failure emits the suppression notice instead
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert_eq!(tracker.failure_count(), 4);

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }
}
