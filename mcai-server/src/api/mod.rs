//! HTTP API handlers for mcai-server

pub mod analyses;
pub mod catalog;
pub mod charts;
pub mod health;
pub mod reports;
pub mod sse;
pub mod webhooks;

pub use analyses::analysis_routes;
pub use catalog::catalog_routes;
pub use charts::chart_routes;
pub use health::health_routes;
pub use reports::report_routes;
pub use sse::event_routes;
pub use webhooks::webhook_routes;

pub(crate) const DEFAULT_PAGE_SIZE: u32 = 50;
pub(crate) const MAX_PAGE_SIZE: u32 = 500;

/// Clamp a requested `?limit=` into `1..=MAX_PAGE_SIZE`
pub(crate) fn page_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}
