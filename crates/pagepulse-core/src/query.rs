//! Memoized read queries
//!
//! SELECT results are cached in a [`TtlCache`] under
//! `db:select:<sql, whitespace collapsed>:<json params>`, so the same text
//! with the same parameters shares one entry. Statements that are not SELECTs
//! go straight to the store and bust the whole `db:select:` family.

use crate::cache::TtlCache;
use crate::error::CoreError;
use crate::store::SqliteEventStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Key prefix shared by every cached SELECT
pub const SELECT_KEY_PREFIX: &str = "db:select:";

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SELECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*select\b").unwrap());

/// Views per article
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleViews {
    pub article_id: Option<i64>,
    pub views: i64,
}

/// Views per calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyViews {
    pub day: String,
    pub views: i64,
}

#[derive(Deserialize)]
struct CountRow {
    n: i64,
}

pub fn is_select(sql: &str) -> bool {
    SELECT_RE.is_match(sql)
}

/// Cache key for a SELECT and its parameters
pub fn select_cache_key(sql: &str, params: &[Value]) -> String {
    let normalized = WHITESPACE_RE.replace_all(sql.trim(), " ");
    let params = if params.is_empty() {
        String::new()
    } else {
        Value::from(params.to_vec()).to_string()
    };
    format!("{}{}:{}", SELECT_KEY_PREFIX, normalized, params)
}

/// Store reads memoized through the shared TTL cache
#[derive(Clone)]
pub struct CachedQueries {
    store: Arc<SqliteEventStore>,
    cache: Arc<TtlCache<Value>>,
}

impl CachedQueries {
    pub fn new(store: Arc<SqliteEventStore>, cache: Arc<TtlCache<Value>>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }

    /// SELECTs are served from cache when fresh; anything else runs directly
    /// and returns `{"rows_affected": n}`
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Value, CoreError> {
        if is_select(sql) {
            return self.select(sql, params).await;
        }

        let affected = self.store.execute(sql, params).await?;
        self.invalidate_selects();
        Ok(json!({ "rows_affected": affected }))
    }

    pub async fn select(&self, sql: &str, params: &[Value]) -> Result<Value, CoreError> {
        self.select_with_ttl(sql, params, self.cache.default_ttl())
            .await
    }

    pub async fn select_with_ttl(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Duration,
    ) -> Result<Value, CoreError> {
        let key = select_cache_key(sql, params);
        self.cache
            .get_or_set_with_ttl(&key, || self.store.query_json(sql, params), ttl)
            .await
    }

    /// Drop every cached SELECT; returns how many entries went
    pub fn invalidate_selects(&self) -> usize {
        let removed = self.cache.invalidate_prefix(SELECT_KEY_PREFIX);
        debug!(removed, "Cached selects invalidated");
        removed
    }

    pub async fn total_views(&self) -> Result<i64, CoreError> {
        let rows: Vec<CountRow> = self
            .select_rows("SELECT COUNT(*) AS n FROM article_view_events", &[])
            .await?;
        Ok(rows.first().map(|row| row.n).unwrap_or(0))
    }

    pub async fn article_views(&self, article_id: i64) -> Result<i64, CoreError> {
        let rows: Vec<CountRow> = self
            .select_rows(
                "SELECT COUNT(*) AS n FROM article_view_events WHERE article_id = ?",
                &[json!(article_id)],
            )
            .await?;
        Ok(rows.first().map(|row| row.n).unwrap_or(0))
    }

    /// Most viewed articles, highest first
    pub async fn top_articles(&self, limit: usize) -> Result<Vec<ArticleViews>, CoreError> {
        self.select_rows(
            r#"
            SELECT article_id, COUNT(*) AS views
            FROM article_view_events
            WHERE article_id IS NOT NULL
            GROUP BY article_id
            ORDER BY views DESC, article_id ASC
            LIMIT ?
            "#,
            &[json!(limit)],
        )
        .await
    }

    /// Views per day for the most recent `days` days that have any
    pub async fn daily_views(&self, days: usize) -> Result<Vec<DailyViews>, CoreError> {
        self.select_rows(
            r#"
            SELECT substr(created_at, 1, 10) AS day, COUNT(*) AS views
            FROM article_view_events
            GROUP BY day
            ORDER BY day DESC
            LIMIT ?
            "#,
            &[json!(days)],
        )
        .await
    }

    async fn select_rows<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>, CoreError> {
        let rows = self.select(sql, params).await?;
        serde_json::from_value(rows).map_err(|e| CoreError::Encode {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ViewEvent;
    use crate::sink::EventSink;
    use crate::store::StoreConfig;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<SqliteEventStore>, CachedQueries) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqliteEventStore::open(&dir.path().join("views.db"), StoreConfig::default()).unwrap(),
        );
        let queries = CachedQueries::new(Arc::clone(&store), Arc::new(TtlCache::default()));
        (dir, store, queries)
    }

    #[test]
    fn test_select_cache_key_normalizes_whitespace() {
        let a = select_cache_key("SELECT *\n   FROM t\tWHERE id = ?", &[json!(1)]);
        let b = select_cache_key("  SELECT * FROM t WHERE id = ?  ", &[json!(1)]);
        assert_eq!(a, b);
        assert_eq!(a, "db:select:SELECT * FROM t WHERE id = ?:[1]");
        assert_ne!(a, select_cache_key("SELECT * FROM t WHERE id = ?", &[json!(2)]));
        assert_eq!(select_cache_key("SELECT 1", &[]), "db:select:SELECT 1:");
    }

    #[test]
    fn test_is_select() {
        assert!(is_select("select 1"));
        assert!(is_select("  SELECT * FROM t"));
        assert!(!is_select("INSERT INTO t VALUES (1)"));
        assert!(!is_select("selection"));
    }

    #[tokio::test]
    async fn test_select_is_served_from_cache_until_invalidated() {
        let (_dir, store, queries) = setup();
        store
            .insert_batch(vec![ViewEvent::new(Some(1)), ViewEvent::new(Some(1))])
            .await
            .unwrap();

        assert_eq!(queries.article_views(1).await.unwrap(), 2);

        // Written behind the cache's back
        store.insert_batch(vec![ViewEvent::new(Some(1))]).await.unwrap();
        assert_eq!(queries.article_views(1).await.unwrap(), 2);

        assert!(queries.invalidate_selects() >= 1);
        assert_eq!(queries.article_views(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_select_runs_directly_and_busts_selects() {
        let (_dir, _store, queries) = setup();
        assert_eq!(queries.total_views().await.unwrap(), 0);

        let result = queries
            .execute(
                "INSERT INTO article_view_events (article_id) VALUES (?)",
                &[json!(5)],
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"rows_affected": 1}));
        assert_eq!(queries.total_views().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_top_articles_and_daily_views() {
        let (_dir, store, queries) = setup();
        let mut events = Vec::new();
        for (article, count) in [(10, 3), (20, 1), (30, 2)] {
            for _ in 0..count {
                let mut event = ViewEvent::new(Some(article));
                event.created_at = Some("2024-05-01 12:00:00".to_string());
                events.push(event);
            }
        }
        events.push(ViewEvent {
            created_at: Some("2024-05-02 08:00:00".to_string()),
            ..Default::default()
        });
        store.insert_batch(events).await.unwrap();

        let top = queries.top_articles(2).await.unwrap();
        assert_eq!(
            top,
            vec![
                ArticleViews {
                    article_id: Some(10),
                    views: 3
                },
                ArticleViews {
                    article_id: Some(30),
                    views: 2
                },
            ]
        );

        let daily = queries.daily_views(7).await.unwrap();
        assert_eq!(
            daily,
            vec![
                DailyViews {
                    day: "2024-05-02".to_string(),
                    views: 1
                },
                DailyViews {
                    day: "2024-05-01".to_string(),
                    views: 6
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_query_error_is_not_cached() {
        let (_dir, _store, queries) = setup();
        assert!(queries.select("SELECT * FROM missing", &[]).await.is_err());
        assert!(queries.cache().is_empty());
    }
}
