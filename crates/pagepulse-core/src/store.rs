//! SQLite event store
//!
//! Persistent sink for the event buffer plus the read/write helpers used by
//! the cached query layer and site settings.
//!
//! Schema:
//! - article_view_events: one row per view, indexed by article
//! - site_config: name/value settings
//! - store_metadata: schema version
//!
//! Every statement runs on the blocking pool. Lock contention
//! (`SQLITE_BUSY` / `SQLITE_LOCKED`) is retried with exponential backoff;
//! any other error is returned straight away.

use crate::error::CoreError;
use crate::models::ViewEvent;
use crate::sink::EventSink;
use anyhow::{bail, Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Current schema version
///
/// Version History:
/// - v1: article_view_events + site_config
/// - v2: index on article_view_events(created_at)
const SCHEMA_VERSION: i64 = 2;

/// Rows per INSERT statement, keeps bound parameters well under SQLite's limit
const INSERT_CHUNK_ROWS: usize = 500;

/// Cap on the backoff between busy retries
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for the event store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Extra attempts after a busy/locked failure
    pub max_retries: u32,

    /// Statements slower than this are logged
    pub slow_query: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            slow_query: Duration::from_millis(2000),
        }
    }
}

/// Delay before retry number `attempt + 1`: `min(1s * 2^attempt, 5s)`
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000u64.saturating_mul(1u64 << attempt.min(16))).min(MAX_BACKOFF)
}

/// SQLite-backed event store (thread-safe)
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    config: StoreConfig,
}

impl SqliteEventStore {
    /// Create or open the database at `path`
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS article_view_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER,
                ip VARCHAR(45),
                user_agent VARCHAR(1024),
                referrer VARCHAR(2048),
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                user_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS site_config (
                name VARCHAR(191) NOT NULL PRIMARY KEY,
                value TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_views_article ON article_view_events(article_id);
            CREATE INDEX IF NOT EXISTS idx_views_created ON article_view_events(created_at);
            "#,
        )
        .context("Failed to create schema")?;

        let stored_version: Option<i64> = conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query schema version")?;

        match stored_version {
            Some(v) if v > SCHEMA_VERSION => {
                bail!(
                    "Database {} has schema v{}, this build supports up to v{}",
                    path.display(),
                    v,
                    SCHEMA_VERSION
                );
            }
            Some(v) if v < SCHEMA_VERSION => {
                // Schema statements above are idempotent, bumping is enough
                conn.execute(
                    "UPDATE store_metadata SET value = ? WHERE key = 'version'",
                    params![SCHEMA_VERSION],
                )
                .context("Failed to update schema version")?;
                debug!(from = v, to = SCHEMA_VERSION, "Schema upgraded");
            }
            None => {
                conn.execute(
                    "INSERT INTO store_metadata (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )
                .context("Failed to initialize schema version")?;
                debug!("Schema version initialized to {}", SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        debug!(path = %path.display(), "Event store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the blocking pool, retrying lock contention with backoff
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;

        loop {
            let conn = Arc::clone(&self.conn);
            let f = Arc::clone(&f);
            let started = Instant::now();

            let result = tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().map_err(|e| CoreError::StorageUnavailable {
                    message: format!("connection lock poisoned: {}", e),
                })?;
                f(&mut conn).map_err(|e| CoreError::database(operation, e))
            })
            .await
            .map_err(|e| CoreError::TaskJoin {
                message: e.to_string(),
            })?;

            let elapsed = started.elapsed();
            if elapsed > self.config.slow_query {
                warn!(
                    operation,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slow query"
                );
            }

            match result {
                Err(e) if e.is_busy() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Database busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_busy() => {
                    return Err(CoreError::DatabaseBusy {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                    });
                }
                other => return other,
            }
        }
    }

    /// Run a SELECT and return its rows as an array of JSON objects
    pub async fn query_json(&self, sql: &str, params: &[Value]) -> Result<Value, CoreError> {
        let sql = sql.to_string();
        let values: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

        self.run("query", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();

            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut object = serde_json::Map::with_capacity(columns.len());
                for (i, name) in columns.iter().enumerate() {
                    object.insert(name.clone(), sql_to_json(row.get_ref(i)?));
                }
                out.push(Value::Object(object));
            }
            Ok(Value::Array(out))
        })
        .await
    }

    /// Run a non-SELECT statement, returning affected rows
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, CoreError> {
        let sql = sql.to_string();
        let values: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

        self.run("execute", move |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))
        })
        .await
    }

    /// All site_config rows
    pub async fn site_config_rows(&self) -> Result<Vec<(String, Option<String>)>, CoreError> {
        self.run("site_config_rows", |conn| {
            let mut stmt = conn.prepare("SELECT name, value FROM site_config ORDER BY name")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }

    /// Insert or replace one site_config value
    pub async fn upsert_site_config(&self, name: &str, value: &str) -> Result<(), CoreError> {
        let name = name.to_string();
        let value = value.to_string();

        self.run("upsert_site_config", move |conn| {
            conn.execute(
                r#"
                INSERT INTO site_config (name, value, updated_at)
                VALUES (?1, ?2, CURRENT_TIMESTAMP)
                ON CONFLICT(name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![name, value],
            )
            .map(|_| ())
        })
        .await
    }

    /// `SELECT 1` round trip; failures are logged, not returned
    pub async fn health_check(&self) -> bool {
        match self
            .run("health_check", |conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            })
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Database health check failed");
                false
            }
        }
    }
}

impl EventSink for SqliteEventStore {
    async fn insert_batch(&self, events: Vec<ViewEvent>) -> Result<usize, CoreError> {
        if events.is_empty() {
            return Ok(0);
        }

        self.run("insert_batch", move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0;

            for chunk in events.chunks(INSERT_CHUNK_ROWS) {
                let placeholders = vec!["(?, ?, ?, ?, COALESCE(?, CURRENT_TIMESTAMP), ?)"; chunk.len()]
                    .join(", ");
                let sql = format!(
                    "INSERT INTO article_view_events \
                     (article_id, ip, user_agent, referrer, created_at, user_id) VALUES {}",
                    placeholders
                );

                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 6);
                for event in chunk {
                    values.push(&event.article_id);
                    values.push(&event.ip);
                    values.push(&event.user_agent);
                    values.push(&event.referrer);
                    values.push(&event.created_at);
                    values.push(&event.user_id);
                }

                written += tx.execute(&sql, values.as_slice())?;
            }

            tx.commit()?;
            Ok(written)
        })
        .await
    }
}

impl Drop for SqliteEventStore {
    fn drop(&mut self) {
        // Fold the WAL back into the main file so it does not grow across restarts
        if let Ok(conn) = self.conn.lock() {
            if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
                warn!("Failed to checkpoint WAL on SqliteEventStore drop: {}", e);
            } else {
                debug!("WAL checkpoint completed on SqliteEventStore drop");
            }
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> SqliteEventStore {
        SqliteEventStore::open(&dir.join("views.db"), StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(5));
        assert_eq!(backoff_delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_insert_batch_preserves_order() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let events: Vec<ViewEvent> = (1..=3)
            .map(|id| {
                ViewEvent::new(Some(id))
                    .with_ip("192.0.2.1")
                    .with_user(id * 10)
            })
            .collect();
        assert_eq!(store.insert_batch(events).await.unwrap(), 3);

        let rows = store
            .query_json(
                "SELECT article_id, ip, user_id FROM article_view_events ORDER BY id",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            json!([
                {"article_id": 1, "ip": "192.0.2.1", "user_id": 10},
                {"article_id": 2, "ip": "192.0.2.1", "user_id": 20},
                {"article_id": 3, "ip": "192.0.2.1", "user_id": 30},
            ])
        );
    }

    #[tokio::test]
    async fn test_insert_batch_spans_chunks() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let events: Vec<ViewEvent> = (0..1200).map(|id| ViewEvent::new(Some(id))).collect();
        assert_eq!(store.insert_batch(events).await.unwrap(), 1200);

        let rows = store
            .query_json("SELECT COUNT(*) AS n FROM article_view_events", &[])
            .await
            .unwrap();
        assert_eq!(rows[0]["n"], json!(1200));
    }

    #[tokio::test]
    async fn test_missing_created_at_defaults_to_now() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .insert_batch(vec![ViewEvent::default()])
            .await
            .unwrap();

        let rows = store
            .query_json("SELECT created_at, article_id FROM article_view_events", &[])
            .await
            .unwrap();
        assert!(rows[0]["created_at"].as_str().is_some_and(|s| s.len() == 19));
        assert_eq!(rows[0]["article_id"], Value::Null);
    }

    #[tokio::test]
    async fn test_failed_statement_is_not_busy() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let err = store
            .query_json("SELECT * FROM no_such_table", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Database { .. }));
        assert!(!err.is_busy());
    }

    #[tokio::test]
    async fn test_query_params_and_execute() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let affected = store
            .execute(
                "INSERT INTO article_view_events (article_id, referrer) VALUES (?, ?)",
                &[json!(9), json!("https://example.org/")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = store
            .query_json(
                "SELECT referrer FROM article_view_events WHERE article_id = ?",
                &[json!(9)],
            )
            .await
            .unwrap();
        assert_eq!(rows, json!([{"referrer": "https://example.org/"}]));
    }

    #[tokio::test]
    async fn test_site_config_upsert() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.upsert_site_config("site_name", "Old").await.unwrap();
        store.upsert_site_config("site_name", "New").await.unwrap();
        store.upsert_site_config("footer", "hi").await.unwrap();

        let rows = store.site_config_rows().await.unwrap();
        assert_eq!(
            rows,
            vec![
                ("footer".to_string(), Some("hi".to_string())),
                ("site_name".to_string(), Some("New".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.health_check().await);
    }

    #[test]
    fn test_reopen_keeps_data_and_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("views.db");

        {
            let store = SqliteEventStore::open(&path, StoreConfig::default()).unwrap();
            let conn = store.conn.lock().unwrap();
            conn.execute("INSERT INTO article_view_events (article_id) VALUES (1)", [])
                .unwrap();
        }

        let store = SqliteEventStore::open(&path, StoreConfig::default()).unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM article_view_events", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("views.db");

        {
            let store = SqliteEventStore::open(&path, StoreConfig::default()).unwrap();
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE store_metadata SET value = ? WHERE key = 'version'",
                params![SCHEMA_VERSION + 1],
            )
            .unwrap();
        }

        assert!(SqliteEventStore::open(&path, StoreConfig::default()).is_err());
    }
}
