//! Fixed-schedule retry.

use std::future::Future;
use std::time::Duration;

/// Delays used when removing a sandbox cgroup.
///
/// The kernel may still be accounting the killed hypervisor against the
/// cgroup for a short while, so `rmdir` gets three attempts.
pub const CGROUP_REMOVE_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1500),
];

/// Run `op` once per entry in `schedule`, sleeping that entry's delay after
/// each failed attempt, until it succeeds.
///
/// Returns the first success or the last error. Sleeps go through
/// `tokio::time`, so tests drive them with a paused clock.
pub async fn retry_with_schedule<T, E, F, Fut>(schedule: &[Duration], mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err = None;
    for (attempt, delay) in schedule.iter().enumerate() {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Attempt failed");
                last_err = Some(e);
                tokio::time::sleep(*delay).await;
            }
        }
    }

    match last_err {
        Some(e) => Err(e),
        // empty schedule: a single attempt, no sleeping
        None => op(0).await,
    }
}
