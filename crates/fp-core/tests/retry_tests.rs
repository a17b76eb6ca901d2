//! RetryPolicy Tests
//!
//! Tests for:
//! - Success after transient failures
//! - Exhaustion with the final error
//! - Backoff spacing with bounded jitter

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fp_core::{RetryError, RetryPolicy};

/// Fails the first `failures` calls and records when each call happened.
struct FlakyOperation {
    failures: u32,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl FlakyOperation {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    async fn call(&self) -> Result<&'static str, String> {
        self.call_times.lock().push(Instant::now());
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(format!("attempt {} failed", n))
        } else {
            Ok("done")
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_after_two_failures() {
    let op = FlakyOperation::new(2);

    let result = policy().run(|| op.call()).await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(op.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_first_success_does_not_wait() {
    let op = FlakyOperation::new(0);
    let start = Instant::now();

    policy().run(|| op.call()).await.unwrap();

    assert_eq!(op.call_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_error() {
    let op = FlakyOperation::always_failing();
    let start = Instant::now();

    let err = policy().run(|| op.call()).await.unwrap_err();

    assert_eq!(op.call_count(), 3);
    assert_eq!(err.attempts(), 3);
    assert_eq!(
        err.to_string(),
        "operation failed after 3 attempts: attempt 3 failed"
    );
    assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    assert_eq!(err.into_last_error(), "attempt 3 failed");

    // 100ms + 200ms of backoff plus under 150ms of jitter, no sleep at the end
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_with_bounded_jitter() {
    let op = FlakyOperation::always_failing();
    let _ = RetryPolicy::new(4, Duration::from_millis(100))
        .run(|| op.call())
        .await;

    let gaps = op.gaps();
    assert_eq!(gaps.len(), 3);
    for (i, gap) in gaps.iter().enumerate() {
        let base = Duration::from_millis(100 * (1 << i));
        assert!(*gap >= base, "gap {} was {:?}", i, gap);
        assert!(*gap < base + base / 2, "gap {} was {:?}", i, gap);
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_attempt_never_sleeps() {
    let op = FlakyOperation::always_failing();
    let start = Instant::now();

    let err = RetryPolicy::new(0, Duration::from_secs(1))
        .run(|| op.call())
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert_eq!(op.call_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[test]
fn test_backoff_saturates() {
    let policy = RetryPolicy::new(5, Duration::from_millis(100));
    assert_eq!(policy.backoff(0), Duration::from_millis(100));
    assert_eq!(policy.backoff(3), Duration::from_millis(800));
    assert!(policy.backoff(200) >= policy.backoff(31));
}
