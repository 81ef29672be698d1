//! Pagination domain logic centralization.
//!
//! Responsibility:
//! - 원격 목록의 `start` / `length` 오프셋 계산
//! - page 0 이 알려준 total 로부터 남은 페이지 요청 목록 산출

/// Default page length requested from the directory.
pub const DEFAULT_PAGE_LENGTH: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub index: u64,
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct PaginationCalculator {
    page_length: u64,
}

impl Default for PaginationCalculator {
    fn default() -> Self {
        Self {
            page_length: DEFAULT_PAGE_LENGTH,
        }
    }
}

impl PaginationCalculator {
    /// A zero length is bumped to 1 so page math never divides by zero.
    pub fn new(page_length: u64) -> Self {
        Self {
            page_length: page_length.max(1),
        }
    }

    pub const fn page_length(&self) -> u64 {
        self.page_length
    }

    pub const fn first_page(&self) -> PageRequest {
        PageRequest {
            index: 0,
            start: 0,
            length: self.page_length,
        }
    }

    /// Total number of pages for `total` items.
    pub const fn page_count(&self, total: u64) -> u64 {
        total.div_ceil(self.page_length)
    }

    /// Requests for pages 1..n-1 in page-index order. Empty when page 0 covers everything.
    pub fn remaining_pages(&self, total: u64) -> Vec<PageRequest> {
        (1..self.page_count(total))
            .map(|index| PageRequest {
                index,
                start: index * self.page_length,
                length: self.page_length,
            })
            .collect()
    }
}
