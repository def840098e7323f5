//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::RetryPolicy;

/// Wait after the `failures`-th consecutive failure: `base_delay` doubled
/// per earlier failure, capped at `max_delay`.
pub fn delay_after(policy: &RetryPolicy, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    policy
        .base_delay
        .saturating_mul(factor)
        .min(policy.max_delay)
}

/// Run `op` up to `policy.attempts` times, sleeping between failures.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// once the budget is spent.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let wait = delay_after(policy, attempt);
                debug!(
                    what,
                    attempt,
                    attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
