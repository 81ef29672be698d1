//! Error taxonomy for sync passes
//!
//! `SyncError` separates the three outcomes a scheduled job cares about:
//! the directory being unavailable, a single request being refused, and the
//! quota gate rejecting a pass. Store and serialization failures are carried
//! through unchanged so the surrounding transaction rolls back.

use thiserror::Error;

use crate::domain::quota::QuotaViolation;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Directory unreachable or server-erroring after the retry budget is spent.
    #[error("Directory service is down during {operation}: {detail}")]
    RemoteDown { operation: String, detail: String },

    /// Non-retryable answer for one request.
    #[error("Directory rejected {operation} with status {status:?}: {detail}")]
    RemoteRejected {
        operation: String,
        status: Option<u16>,
        detail: String,
    },

    #[error("Quota gate rejected the pass: {}", format_violations(.violations))]
    QuotaExceeded { violations: Vec<QuotaViolation> },

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// `true` when the whole job should stop right away.
    pub const fn is_remote_down(&self) -> bool {
        matches!(self, Self::RemoteDown { .. })
    }

    pub const fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

fn format_violations(violations: &[QuotaViolation]) -> String {
    violations
        .iter()
        .map(|v| {
            format!(
                "pool {} (issued {} + pending {} >= capacity {})",
                v.pool_id, v.issued, v.pending, v.capacity
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub type SyncResult<T> = Result<T, SyncError>;
