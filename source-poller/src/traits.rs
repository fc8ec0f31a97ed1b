use crate::types::{Page, RateBudget, Result};
use async_trait::async_trait;

/// Trait for pulling pages of items from a paginated, rate-limited API
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page of `source` starting after `cursor` (empty = newest).
    async fn fetch_page(&self, source: &str, limit: usize, cursor: &str) -> Result<Page>;

    /// Most recent usage counters reported by the API
    fn rate_budget(&self) -> RateBudget;
}
