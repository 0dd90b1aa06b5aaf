//! Infrastructure-level retry for storage and queue calls.
//!
//! Every call runs under one scoped timeout; transient failures
//! ([`StorageError::is_transient`]) are retried with exponential backoff
//! (`backoff_ms * 2^(attempt-1)`: 500 ms → 1 s → 2 s with the defaults).
//! Permanent failures (missing object, constraint violation) return at once.
//!
//! This budget is independent of the extraction-attempt budget in
//! [`crate::pipeline::extractor`].

use crate::config::PipelineConfig;
use crate::error::StorageError;
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};
use tracing::warn;

/// Retry budget, backoff base and per-call timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn for_storage(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
            timeout: Duration::from_secs(config.storage_timeout_secs),
        }
    }

    pub fn for_model(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Run `op` under the policy, retrying transient storage failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut last_err: Option<StorageError> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = policy.backoff(attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                operation,
                attempt,
                policy.max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => {
                warn!("{}: attempt {} failed: {}", operation, attempt + 1, e);
                last_err = Some(e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let e = StorageError::Timeout {
                    operation: operation.to_string(),
                    secs: policy.timeout.as_secs(),
                };
                warn!("{}: attempt {} failed: {}", operation, attempt + 1, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| StorageError::Io {
        operation: operation.to_string(),
        detail: "no attempt was made".into(),
    }))
}
