//! Periodic liveness signal for a long-running handler.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::OptionFuture;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

use crate::error::WorkerResult;
use crate::retry::FailureTracker;

/// Failures logged before a heartbeat goes quiet.
const MAX_LOGGED_FAILURES: u32 = 3;

/// Drive `work` to completion, calling `beat` every `interval` until it
/// finishes. The beat runs alongside the work, at most one at a time, and
/// its failures never interrupt the work.
pub async fn with_heartbeat<T, W, B, BF>(work: W, interval: Duration, label: &'static str, mut beat: B) -> T
where
    W: Future<Output = T>,
    B: FnMut() -> BF,
    BF: Future<Output = WorkerResult<()>>,
{
    tokio::pin!(work);
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = FailureTracker::new(label, MAX_LOGGED_FAILURES);
    let mut in_flight: Option<Pin<Box<BF>>> = None;

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick(), if in_flight.is_none() => in_flight = Some(Box::pin(beat())),
            Some(result) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                match result {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(task = label, "Heartbeat failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::WorkerError;

    #[tokio::test]
    async fn test_beats_while_work_runs() {
        let beats = Arc::new(AtomicU32::new(0));
        let counter = beats.clone();

        let output = with_heartbeat(
            async {
                tokio::time::sleep(Duration::from_millis(120)).await;
                "done"
            },
            Duration::from_millis(20),
            "test",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(output, "done");
        assert!(beats.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_failing_beat_does_not_stop_work() {
        let output = with_heartbeat(
            async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                42
            },
            Duration::from_millis(10),
            "test",
            || async { Err(WorkerError::job_failed("store down")) },
        )
        .await;
        assert_eq!(output, 42);
    }

    #[tokio::test]
    async fn test_slow_beat_does_not_hold_up_work() {
        let started = Instant::now();
        let output = with_heartbeat(
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "done"
            },
            Duration::from_millis(10),
            "test",
            || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
        )
        .await;

        assert_eq!(output, "done");
        assert!(started.elapsed() < Duration::from_millis(300), "work waited on a deadline extension");
    }

    #[tokio::test]
    async fn test_beats_never_overlap() {
        let running = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicU32::new(0));
        let (r, o) = (running.clone(), overlapped.clone());

        with_heartbeat(
            tokio::time::sleep(Duration::from_millis(150)),
            Duration::from_millis(5),
            "test",
            move || {
                let (running, overlapped) = (r.clone(), o.clone());
                async move {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quick_work_never_beats() {
        let beats = Arc::new(AtomicU32::new(0));
        let counter = beats.clone();
        with_heartbeat(async {}, Duration::from_secs(30), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(beats.load(Ordering::SeqCst), 0);
    }
}
