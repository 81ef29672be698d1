//! Paginated collection fetcher
//!
//! Drains a paged directory listing into one ordered collection: page 0
//! first to learn the total, then the remaining pages through the bounded
//! executor. Page-index order, not completion order, decides the result.

use std::future::Future;

use tracing::{debug, info, warn};

use crate::domain::pagination::PaginationCalculator;
use crate::domain::remote::Page;
use crate::error::SyncResult;
use crate::infrastructure::executor::run_bounded;

#[derive(Debug, Clone)]
pub struct PageFetcher {
    calculator: PaginationCalculator,
    concurrency: usize,
}

impl PageFetcher {
    pub fn new(page_length: u64, concurrency: usize) -> Self {
        Self {
            calculator: PaginationCalculator::new(page_length),
            concurrency,
        }
    }

    /// Fetch every page of a listing. `fetch_page(start, length)` performs one call.
    ///
    /// Any page failure fails the whole collection; a partial listing would
    /// turn missing rows into deletions downstream.
    pub async fn fetch_all<T, F, Fut>(&self, label: &str, fetch_page: F) -> SyncResult<Vec<T>>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = SyncResult<Page<T>>>,
    {
        let first = self.calculator.first_page();
        let first_page = fetch_page(first.start, first.length).await?;

        let Some(total) = first_page.total_count().filter(|&t| t > 0) else {
            if !first_page.total.is_null() && first_page.total_count().is_none() {
                warn!("⚠️ {}: malformed total {:?}, using page 0 only", label, first_page.total);
            }
            debug!("📄 {}: {} item(s) from page 0 only", label, first_page.data.len());
            return Ok(first_page.data);
        };

        let remaining = self.calculator.remaining_pages(total);
        info!(
            "📄 {}: total {} across {} page(s) of {}",
            label,
            total,
            remaining.len() + 1,
            self.calculator.page_length()
        );

        let mut items = first_page.data;
        let fetch_page = &fetch_page;
        let pages = run_bounded(remaining, self.concurrency, |request| async move {
            fetch_page(request.start, request.length).await
        })
        .await;

        for page in pages {
            items.extend(page?.data);
        }

        if items.len() as u64 != total {
            debug!("📄 {}: collected {} item(s), directory reported {}", label, items.len(), total);
        }
        Ok(items)
    }
}
