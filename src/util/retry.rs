//! Retry policy for fallible asynchronous operations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The retry budget was spent; carries the last failure.
    #[error("maximum retry count reached")]
    Exhausted(#[source] E),
    /// The operation failed with an error the policy does not retry.
    #[error(transparent)]
    Fatal(E),
}

/// How often and how quickly to retry an operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: Option<u32>,
    interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(100),
            interval: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Create a policy retrying at most `max_retries` times.
    #[must_use]
    pub const fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            interval,
        }
    }

    /// Create a policy that retries until the operation succeeds.
    #[must_use]
    pub const fn unlimited(interval: Duration) -> Self {
        Self {
            max_retries: None,
            interval,
        }
    }

    /// Run `operation`, retrying failures for which `retryable` returns true.
    ///
    /// # Errors
    /// Returns [`RetryError::Fatal`] on a non-retryable failure and
    /// [`RetryError::Exhausted`] when the retry budget runs out.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::error::Error + 'static,
    {
        let mut attempts = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) => {
                    if let Some(max) = self.max_retries {
                        if attempts >= max {
                            return Err(RetryError::Exhausted(err));
                        }
                    }
                    attempts += 1;
                    tokio::time::sleep(self.interval).await;
                }
                Err(err) => return Err(RetryError::Fatal(err)),
            }
        }
    }
}
