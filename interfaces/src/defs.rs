use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One fetched item, as stored and as published in statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub author: String,
    pub source: String,
    pub url: String,
    pub created_utc: f64,
    pub created_at: DateTime<Utc>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: i64,
    pub num_comments: i64,
    pub post_hint: String,
    pub is_video: bool,
    pub is_self: bool,
    pub self_text: String,
    pub permalink: String,
    pub processed_at: DateTime<Utc>,
}

impl Item {
    /// Minimal item for a source; the remaining fields take neutral values.
    pub fn new(id: impl Into<String>, source: impl Into<String>, author: impl Into<String>, upvotes: i64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            author: author.into(),
            source: source.into(),
            url: String::new(),
            created_utc: now.timestamp() as f64,
            created_at: now,
            upvotes,
            downvotes: 0,
            score: upvotes,
            num_comments: 0,
            post_hint: String::new(),
            is_video: false,
            is_self: false,
            self_text: String::new(),
            permalink: String::new(),
            processed_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence and aggregate queries consumed by the poller.
///
/// Implementations must be safe to call from many tasks at once; the poller
/// never coordinates access to them.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or replace an item keyed by its id.
    async fn save_item(&self, item: &Item) -> StoreResult<()>;

    /// Items ordered by upvotes, highest first.
    async fn top_items(&self, limit: usize) -> StoreResult<Vec<Item>>;

    /// Authors mapped to their stored item count, for the `limit` most prolific.
    async fn top_authors(&self, limit: usize) -> StoreResult<HashMap<String, i64>>;

    async fn total_count(&self) -> StoreResult<i64>;

    async fn items_by_source(&self, source: &str) -> StoreResult<Vec<Item>>;
}
