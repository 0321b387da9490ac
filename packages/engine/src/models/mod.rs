pub mod reference;
pub mod session;
pub mod upload;

use serde::Serialize;

/// Pagination metadata included in list responses.
#[derive(Debug, Serialize)]
pub struct Pagination {
    /// Current page number (1-based).
    pub page: u64,
    /// Number of items per page.
    pub per_page: u64,
    /// Total number of matching items across all pages.
    pub total: u64,
    /// Total number of pages.
    pub total_pages: u64,
}
