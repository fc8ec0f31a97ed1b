use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use interfaces::defs::{Item, ItemStore};
use tracing::{error, info};

use crate::state::{SourceStats, Statistics, StatsState};
use crate::types::Result;

pub const TOP_LIMIT: usize = 10;

/// Rebuilds the published statistics from the item store.
pub struct StatsAggregator {
    store: Arc<dyn ItemStore>,
    state: Arc<StatsState>,
    sources: Vec<String>,
    top_limit: usize,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn ItemStore>, state: Arc<StatsState>, sources: Vec<String>) -> Self {
        Self {
            store,
            state,
            sources,
            top_limit: TOP_LIMIT,
        }
    }

    pub fn state(&self) -> &Arc<StatsState> {
        &self.state
    }

    /// Recompute and publish a new snapshot.
    ///
    /// A failing global query leaves the previous snapshot in place. A failing
    /// per-source query only drops that source from the new snapshot.
    pub async fn refresh(&self, processed_item_count: u64) -> Result<Arc<Statistics>> {
        let top_items = self.store.top_items(self.top_limit).await.map_err(|e| {
            error!("Failed to get top items: {}", e);
            e
        })?;
        let top_authors = self.store.top_authors(self.top_limit).await.map_err(|e| {
            error!("Failed to get top authors: {}", e);
            e
        })?;
        let total_items = self.store.total_count().await.map_err(|e| {
            error!("Failed to get total item count: {}", e);
            e
        })?;

        let mut source_stats = HashMap::new();
        for source in &self.sources {
            let items = match self.store.items_by_source(source).await {
                Ok(items) => items,
                Err(e) => {
                    error!("Failed to get items for {}: {}", source, e);
                    continue;
                }
            };

            let item_count = items.len();
            if let Some(top_item) = highest_upvoted(items) {
                source_stats.insert(source.clone(), SourceStats { item_count, top_item });
            }
        }

        let stats = Statistics {
            total_items,
            processed_item_count,
            top_items,
            top_authors,
            source_stats,
            start_time: self.state.start_time(),
            last_updated: Utc::now(),
        };
        self.state.publish(stats);
        Ok(self.state.snapshot())
    }

    pub fn log_summary(&self, processed_item_count: u64) {
        let stats = self.state.snapshot();
        let with_data = self
            .sources
            .iter()
            .filter(|source| stats.source_stats.contains_key(*source))
            .count();
        let running_for = Utc::now().signed_duration_since(stats.start_time);

        info!(
            total_items = stats.total_items,
            processed_in_run = processed_item_count,
            source_count = self.sources.len(),
            sources_with_data = with_data,
            running_since_secs = running_for.num_seconds(),
            "Statistics updated"
        );
    }
}

/// First item with the most upvotes.
fn highest_upvoted(items: Vec<Item>) -> Option<Item> {
    let mut iter = items.into_iter();
    let mut best = iter.next()?;
    for item in iter {
        if item.upvotes > best.upvotes {
            best = item;
        }
    }
    Some(best)
}
