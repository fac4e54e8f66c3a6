use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

/// Retry a fallible async operation with exponential backoff until it
/// succeeds or `deadline` elapses.
///
/// - `base_delay`: delay after the first failure, doubled on each
///   subsequent failure and capped at five seconds.
/// - `label`: description for log messages and the timeout error.
///
/// The last underlying error is kept in the chain so callers can still see
/// what actually went wrong.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    deadline: Duration,
    base_delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = std::time::Instant::now();
    let mut delay = base_delay;
    let mut attempt = 1u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if started.elapsed() + delay >= deadline {
                    return Err(
                        e.context(format!("{} did not succeed within {:?}", label, deadline))
                    );
                }
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
                attempt += 1;
            }
        }
    }
}
