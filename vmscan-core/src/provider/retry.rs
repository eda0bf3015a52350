//! Deadline-bounded retry and readiness polling driven by the provider error
//! taxonomy.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::error::{ProviderError, ProviderResult};

/// Bounds for a retry or wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget, measured from the first attempt.
    pub timeout: Duration,
    /// Tick between readiness probes that report "not yet".
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("deadline of {0:?} elapsed")]
    Timeout(Duration),

    #[error("wait cancelled")]
    Cancelled,
}

/// Invoke `op` until it succeeds.
///
/// Retryable errors are retried after their suggested delay, capped by the
/// remaining budget. Fatal errors end the loop immediately.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(WaitError::Timeout(policy.timeout));
            }
            outcome = op() => outcome,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                let after = backoff_for(err, attempt)?;
                pause(after, deadline, policy.timeout, cancel).await?;
            }
        }
    }
}

/// Poll `probe` every `policy.interval` until it reports `true`.
///
/// Probe errors follow the same rules as [`retry`].
pub async fn wait_until<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<bool>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(WaitError::Timeout(policy.timeout));
            }
            outcome = probe() => outcome,
        };

        let delay = match outcome {
            Ok(true) => return Ok(()),
            Ok(false) => policy.interval,
            Err(err) => backoff_for(err, attempt)?,
        };
        pause(delay, deadline, policy.timeout, cancel).await?;
    }
}

fn backoff_for(err: ProviderError, attempt: u32) -> Result<Duration, WaitError> {
    match err.retry_after() {
        Some(after) => {
            tracing::debug!(
                target: "vmscan::provider",
                attempt,
                retry_after = ?after,
                error = %err,
                "retryable provider error"
            );
            Ok(after)
        }
        None => Err(WaitError::Provider(err)),
    }
}

async fn pause(
    delay: Duration,
    deadline: Instant,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let wake = (Instant::now() + delay).min(deadline);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        _ = sleep_until(wake) => {
            if wake >= deadline {
                Err(WaitError::Timeout(budget))
            } else {
                Ok(())
            }
        }
    }
}
