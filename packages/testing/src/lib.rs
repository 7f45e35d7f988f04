#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in tickwatch packages.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

// Aggregates in tests are sums and averages of small integers.
const F64_TOLERANCE: f64 = 0.000_001;

/// How long [`with_watchdog()`] lets a test run before declaring it hung.
///
/// Miri is dramatically slower at thread synchronization, so it gets more time.
#[must_use]
pub fn watchdog_timeout() -> Duration {
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs a test on a separate thread and fails it if it does not finish within
/// [`watchdog_timeout()`].
///
/// Tests of scheduler threads, listener fan-out and lock ordering use this so that a
/// deadlock fails the test instead of hanging the run. With `MUTATION_TESTING=1` the test
/// runs directly on the calling thread, so hanging mutations are detected by the mutation
/// tester's own timeout.
///
/// # Panics
///
/// Panics if the test does not finish in time, or with the test's own panic.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let sum = with_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::Builder::new()
        .name("tickwatch-test".to_string())
        .spawn(move || {
            // The receiver is gone if we already timed out.
            drop(tx.send(test_fn()));
        })
        .expect("spawning the test thread must succeed");

    let timeout = watchdog_timeout();

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread finished after reporting");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, probably deadlocked");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it returns `true`.
///
/// Used by tests that observe work done by scheduler threads, where there is no
/// completion signal to block on.
///
/// # Panics
///
/// Panics if the condition is still `false` after `timeout`.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::wait_until;
///
/// wait_until(Duration::from_secs(1), || true);
/// ```
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;

    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );

        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Asserts that an aggregate computed in floating point equals `expected`, give or take
/// rounding.
///
/// # Panics
///
/// Panics if the values differ by more than a millionth.
///
/// # Example
///
/// ```rust
/// use testing::assert_close;
///
/// assert_close(0.1 + 0.2, 0.3);
/// ```
#[track_caller]
pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= F64_TOLERANCE,
        "{actual} is not close to {expected}"
    );
}
