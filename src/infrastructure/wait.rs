//! Condition Polling
//!
//! Poll a predicate until it holds or a deadline passes. Used by tests and
//! by operational health checks such as "has this secondary caught up".

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),
}

/// Block the current thread until `predicate` returns true.
///
/// Returns how long it took. The predicate is always checked at least once,
/// and once more at the deadline.
pub fn await_condition<F>(mut predicate: F, timeout: Duration, interval: Duration) -> Result<Duration, WaitError>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if predicate() {
            return Ok(started.elapsed());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(WaitError::TimedOut(timeout));
        }
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}

/// Async variant of [`await_condition`]; sleeps on the tokio timer.
pub async fn await_condition_async<F>(
    mut predicate: F,
    timeout: Duration,
    interval: Duration,
) -> Result<Duration, WaitError>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if predicate() {
            return Ok(started.elapsed());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(WaitError::TimedOut(timeout));
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}
