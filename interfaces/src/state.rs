use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::defs::{Item, ItemStore, StoreResult};

const ITEM_COLUMNS: &str = "
    id, title, author, source, url, created_utc, created_at,
    upvotes, downvotes, score, num_comments, post_hint,
    is_video, is_self, self_text, permalink, processed_at
";

/// SQLite-backed item store.
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { db };
        store.init_tables().await?;
        info!("Opened item database at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database. The database lives and dies with its one
    /// connection, so that connection is never reaped or recycled.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { db };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                source TEXT NOT NULL,
                url TEXT,
                created_utc REAL NOT NULL,
                created_at TIMESTAMP NOT NULL,
                upvotes INTEGER NOT NULL,
                downvotes INTEGER NOT NULL,
                score INTEGER NOT NULL,
                num_comments INTEGER NOT NULL,
                post_hint TEXT,
                is_video BOOLEAN NOT NULL,
                is_self BOOLEAN NOT NULL,
                self_text TEXT,
                permalink TEXT NOT NULL,
                processed_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_upvotes ON items(upvotes DESC)")
            .execute(&self.db)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_author ON items(author)")
            .execute(&self.db)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_source ON items(source)")
            .execute(&self.db)
            .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

fn item_from_row(row: &SqliteRow) -> StoreResult<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        source: row.try_get("source")?,
        url: row.try_get::<Option<String>, _>("url")?.unwrap_or_default(),
        created_utc: row.try_get("created_utc")?,
        created_at: row.try_get("created_at")?,
        upvotes: row.try_get("upvotes")?,
        downvotes: row.try_get("downvotes")?,
        score: row.try_get("score")?,
        num_comments: row.try_get("num_comments")?,
        post_hint: row.try_get::<Option<String>, _>("post_hint")?.unwrap_or_default(),
        is_video: row.try_get("is_video")?,
        is_self: row.try_get("is_self")?,
        self_text: row.try_get::<Option<String>, _>("self_text")?.unwrap_or_default(),
        permalink: row.try_get("permalink")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn save_item(&self, item: &Item) -> StoreResult<()> {
        let query = format!(
            "INSERT OR REPLACE INTO items ({ITEM_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        );
        sqlx::query(&query)
            .bind(&item.id)
            .bind(&item.title)
            .bind(&item.author)
            .bind(&item.source)
            .bind(&item.url)
            .bind(item.created_utc)
            .bind(item.created_at)
            .bind(item.upvotes)
            .bind(item.downvotes)
            .bind(item.score)
            .bind(item.num_comments)
            .bind(&item.post_hint)
            .bind(item.is_video)
            .bind(item.is_self)
            .bind(&item.self_text)
            .bind(&item.permalink)
            .bind(item.processed_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn top_items(&self, limit: usize) -> StoreResult<Vec<Item>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY upvotes DESC LIMIT ?1");
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn top_authors(&self, limit: usize) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT author, COUNT(*) AS item_count
            FROM items
            GROUP BY author
            ORDER BY item_count DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        let mut authors = HashMap::with_capacity(rows.len());
        for row in rows {
            let author: String = row.try_get("author")?;
            let count: i64 = row.try_get("item_count")?;
            authors.insert(author, count);
        }
        Ok(authors)
    }

    async fn total_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    async fn items_by_source(&self, source: &str) -> StoreResult<Vec<Item>> {
        let query = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE source = ?1 ORDER BY upvotes DESC"
        );
        let rows = sqlx::query(&query)
            .bind(source)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(item_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_replaces_by_id_and_counts() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.save_item(&Item::new("p1", "rust", "alice", 10)).await.unwrap();
        store.save_item(&Item::new("p1", "rust", "alice", 25)).await.unwrap();
        store.save_item(&Item::new("p2", "golang", "bob", 5)).await.unwrap();

        assert_eq!(store.total_count().await.unwrap(), 2);

        let top = store.top_items(10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, "p1");
        assert_eq!(top[0].upvotes, 25);
    }

    #[tokio::test]
    async fn top_authors_groups_by_author() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (id, author) in [("a", "alice"), ("b", "alice"), ("c", "bob"), ("d", "carol")] {
            store.save_item(&Item::new(id, "rust", author, 1)).await.unwrap();
        }

        let authors = store.top_authors(2).await.unwrap();
        assert_eq!(authors.len(), 2);
        assert_eq!(authors.get("alice"), Some(&2));
    }

    #[tokio::test]
    async fn items_by_source_filters_and_round_trips_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut item = Item::new("x1", "rust", "alice", 7);
        item.title = "Borrow checker tips".to_string();
        item.is_self = true;
        store.save_item(&item).await.unwrap();
        store.save_item(&Item::new("x2", "golang", "bob", 3)).await.unwrap();

        let rust = store.items_by_source("rust").await.unwrap();
        assert_eq!(rust.len(), 1);
        assert_eq!(rust[0].title, "Borrow checker tips");
        assert!(rust[0].is_self);
        assert_eq!(rust[0].created_at.timestamp(), item.created_at.timestamp());

        assert!(store.items_by_source("python").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_connection_is_never_recycled() {
        let store = SqliteStore::in_memory().await.unwrap();
        let options = store.db.options();

        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert!(options.get_idle_timeout().is_none());
        assert!(options.get_max_lifetime().is_none());

        store.save_item(&Item::new("a", "rust", "ferris", 1)).await.unwrap();
        assert_eq!(store.total_count().await.unwrap(), 1);
    }
}
