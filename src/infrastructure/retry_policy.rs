//! Retry policy for directory calls
//!
//! One logical call = up to `max_attempts` attempts, each bounded by its own
//! timeout. Retryable failures back off exponentially with random jitter.
//! When the budget is spent the failure is classified as either
//! `SyncError::RemoteDown` (stop the job) or `SyncError::RemoteRejected`
//! (caller may handle per item).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Statuses worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// No response at all: connect error, reset, or timeout.
    NoResponse(String),
    /// The directory answered with a non-success status.
    Status { status: u16, detail: String },
    /// The directory answered 2xx but the body was unusable.
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_ms: u64,
    pub request_timeout_ms: u64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
            request_timeout_ms: 30_000,
            retryable_statuses: RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn is_retryable(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::NoResponse(_) => true,
            AttemptFailure::Status { status, .. } => self.retryable_statuses.contains(status),
            AttemptFailure::Decode(_) => false,
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter: base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=self.jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }

    /// Run `call` under this policy.
    ///
    /// `call` is invoked once per attempt and must build a fresh request each time.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match timeout(self.request_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(AttemptFailure::NoResponse(format!(
                    "timed out after {:?}",
                    self.request_timeout()
                ))),
            };

            let failure = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ {} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !self.is_retryable(&failure) || attempt >= max_attempts {
                return Err(classify(operation, failure, attempt));
            }

            let delay = self.backoff_with_jitter(attempt);
            warn!(
                "🔄 {} failed (attempt {}/{}), retrying in {:?}: {:?}",
                operation, attempt, max_attempts, delay, failure
            );
            sleep(delay).await;
        }
    }
}

/// Final classification once no more attempts will be made.
///
/// Down: no response, any 5xx, 408 or 429. Everything else is a rejection.
pub fn classify(operation: &str, failure: AttemptFailure, attempts: u32) -> SyncError {
    match failure {
        AttemptFailure::NoResponse(detail) => SyncError::RemoteDown {
            operation: operation.to_string(),
            detail: format!("{detail} (after {attempts} attempt(s))"),
        },
        AttemptFailure::Status { status, detail } if status >= 500 || status == 408 || status == 429 => {
            SyncError::RemoteDown {
                operation: operation.to_string(),
                detail: format!("HTTP {status}: {detail} (after {attempts} attempt(s))"),
            }
        }
        AttemptFailure::Status { status, detail } => SyncError::RemoteRejected {
            operation: operation.to_string(),
            status: Some(status),
            detail,
        },
        AttemptFailure::Decode(detail) => SyncError::RemoteRejected {
            operation: operation.to_string(),
            status: None,
            detail,
        },
    }
}
