//! Bounded concurrency executor
//!
//! Runs a transform over an ordered input list with at most `limit`
//! transforms in flight. Outputs come back in input order regardless of
//! completion order. Failures are values: a transform that returns `Err`
//! does not cancel its siblings.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

/// Page fan-out limit toward the directory.
pub const PAGE_FETCH_CONCURRENCY: usize = 3;

/// Per-institution attachment fetch limit.
pub const ATTACHMENT_FETCH_CONCURRENCY: usize = 5;

/// Apply `transform` to every input with at most `limit` calls outstanding.
///
/// Everything runs on the calling task (no `spawn`), so the transform may
/// borrow from the caller. A `limit` of 0 is treated as 1.
pub async fn run_bounded<I, O, F, Fut>(inputs: Vec<I>, limit: usize, transform: F) -> Vec<O>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = O>,
{
    if inputs.is_empty() {
        return Vec::new();
    }

    let limit = limit.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let total = inputs.len();
    debug!("🚦 Running {} transforms with concurrency limit {}", total, limit);

    let transform = &transform;
    let tasks = inputs.into_iter().map(|input| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            // never closed, so acquire cannot fail
            let _permit = semaphore.acquire_owned().await;
            transform(input).await
        }
    });

    futures::future::join_all(tasks).await
}
