//! Automatic error recovery strategies.
//
// Hardware round-trips to the focus actuator are retried a bounded number of times
// before the current object is given up. Nothing here ever escalates past the
// object being focused. Every collaborator call is also bounded in time, so a
// device that never answers turns into an ordinary error.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// The delay between retry attempts in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    /// The delay between attempts.
    pub fn backoff_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Runs `op` until it succeeds or the policy's attempts are exhausted.
///
/// Returns the last error on exhaustion. A policy with `max_attempts == 0` still
/// makes one attempt.
///
/// ```
/// use rust_microscan::error_recovery::{retry_async, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let policy = RetryPolicy { max_attempts: 2, backoff_ms: 0 };
/// let z = retry_async(&policy, "read_position", || async { Ok::<_, anyhow::Error>(12.5) })
///     .await?;
/// assert_eq!(z, 12.5);
/// # Ok::<(), anyhow::Error>(())
/// # })?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(operation = label, attempt, max_attempts = attempts, error = %err, "Retrying hardware call");
                sleep(policy.backoff_delay()).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err.context(format!("{label} failed after {attempts} attempts")));
            }
        }
    }
}

/// Bounds one collaborator call by `limit`. An expired call is an error naming `label`.
pub async fn with_timeout<T, Fut>(limit: Duration, label: &str, call: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = label, timeout = ?limit, "Hardware call timed out");
            Err(anyhow::anyhow!("{label} timed out after {limit:?}"))
        }
    }
}
