use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::defs::{Item, ItemStore, StoreResult};

/// Item store kept entirely in process memory.
///
/// Ordering ties are broken by insertion order so results are stable.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<Vec<Item>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn save_item(&self, item: &Item) -> StoreResult<()> {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        Ok(())
    }

    async fn top_items(&self, limit: usize) -> StoreResult<Vec<Item>> {
        let mut items = self.items.read().await.clone();
        items.sort_by(|a, b| b.upvotes.cmp(&a.upvotes));
        items.truncate(limit);
        Ok(items)
    }

    async fn top_authors(&self, limit: usize) -> StoreResult<HashMap<String, i64>> {
        let items = self.items.read().await;
        let mut by_author: HashMap<&str, i64> = HashMap::new();
        for item in items.iter() {
            *by_author.entry(item.author.as_str()).or_insert(0) += 1;
        }

        let mut counts: Vec<(String, i64)> = by_author
            .into_iter()
            .map(|(author, count)| (author.to_string(), count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        Ok(counts.into_iter().collect())
    }

    async fn total_count(&self) -> StoreResult<i64> {
        Ok(self.items.read().await.len() as i64)
    }

    async fn items_by_source(&self, source: &str) -> StoreResult<Vec<Item>> {
        let items = self.items.read().await;
        Ok(items.iter().filter(|item| item.source == source).cloned().collect())
    }
}
