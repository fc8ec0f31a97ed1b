use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

/// Pagination cursor per source. An empty cursor means "start from newest".
///
/// One lock guards the whole table. Callers read the cursor, fetch without
/// holding anything, then write the new cursor back.
#[derive(Debug, Default)]
pub struct PaginationRegistry {
    cursors: RwLock<HashMap<String, String>>,
}

impl PaginationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source: &str) -> String {
        let cursors = self.cursors.read().await;
        cursors.get(source).cloned().unwrap_or_default()
    }

    pub async fn set(&self, source: &str, cursor: impl Into<String>) {
        let cursor = cursor.into();
        let mut cursors = self.cursors.write().await;
        debug!("Cursor for {} is now {:?}", source, cursor);
        cursors.insert(source.to_string(), cursor);
    }

    /// Clear every known cursor so the next fetch starts from the newest page.
    /// Returns how many sources were reset.
    pub async fn reset_all(&self) -> usize {
        let mut cursors = self.cursors.write().await;
        let old: HashMap<String, String> = cursors.clone();
        for cursor in cursors.values_mut() {
            cursor.clear();
        }

        info!(old_cursors = ?old, "Reset pagination cursors to check for newest items");
        cursors.len()
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.cursors.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_source_has_empty_cursor() {
        let registry = PaginationRegistry::new();
        assert_eq!(registry.get("rust").await, "");
    }

    #[tokio::test]
    async fn reset_all_clears_known_sources_only() {
        let registry = PaginationRegistry::new();
        registry.set("rust", "t3_abc").await;
        registry.set("golang", "t3_def").await;

        assert_eq!(registry.reset_all().await, 2);

        assert_eq!(registry.get("rust").await, "");
        assert_eq!(registry.get("golang").await, "");
        assert_eq!(registry.get("never_written").await, "");
        assert!(!registry.snapshot().await.contains_key("never_written"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sets_on_different_sources() {
        let registry = Arc::new(PaginationRegistry::new());

        for round in 0..50 {
            let a = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.set("a", format!("x{round}")).await })
            };
            let b = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.set("b", format!("y{round}")).await })
            };
            a.await.unwrap();
            b.await.unwrap();

            assert_eq!(registry.get("a").await, format!("x{round}"));
            assert_eq!(registry.get("b").await, format!("y{round}"));
        }
    }
}
