//! Database models for the notification pipeline.

pub mod dead_letter;
pub mod notification;
pub mod preferences;
pub mod template;

pub use dead_letter::*;
pub use notification::*;
pub use preferences::*;
pub use template::*;

use serde::{Deserialize, Serialize};

/// Default page size for list queries.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Upper bound on page size for list queries.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Pagination parameters (1-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }.normalized()
    }

    /// Clamp to `page >= 1` and `1 <= limit <= MAX_PAGE_LIMIT`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_clamps() {
        let p = Pagination::new(0, 1000);
        assert_eq!(p.page, 1);
        assert_eq!(p.limit, MAX_PAGE_LIMIT);
        assert_eq!(p.offset(), 0);

        assert_eq!(Pagination::new(3, 20).offset(), 40);
    }
}
