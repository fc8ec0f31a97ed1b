use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use interfaces::defs::Item;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub item_count: usize,
    pub top_item: Item,
}

/// Point-in-time statistics. Never mutated after publication.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_items: i64,
    pub processed_item_count: u64,
    pub top_items: Vec<Item>,
    pub top_authors: HashMap<String, i64>,
    pub source_stats: HashMap<String, SourceStats>,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Statistics {
    pub fn empty(start_time: DateTime<Utc>) -> Self {
        Self {
            total_items: 0,
            processed_item_count: 0,
            top_items: Vec::new(),
            top_authors: HashMap::new(),
            source_stats: HashMap::new(),
            start_time,
            last_updated: start_time,
        }
    }
}

/// Latest published statistics, shared between the aggregator and readers.
#[derive(Debug)]
pub struct StatsState {
    current: RwLock<Arc<Statistics>>,
}

impl StatsState {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Statistics::empty(Utc::now()))),
        }
    }

    pub fn snapshot(&self) -> Arc<Statistics> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn source_stats(&self, source: &str) -> Option<SourceStats> {
        self.snapshot().source_stats.get(source).cloned()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.snapshot().start_time
    }

    /// Replace the published snapshot wholesale.
    pub fn publish(&self, stats: Statistics) {
        let stats = Arc::new(stats);
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = stats;
    }
}

impl Default for StatsState {
    fn default() -> Self {
        Self::new()
    }
}
