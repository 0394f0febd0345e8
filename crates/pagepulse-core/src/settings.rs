//! Site settings backed by the `site_config` table
//!
//! The whole table is read at once and cached under `site-config:all`.
//! Reads degrade to an empty map when storage fails; writes report success
//! as a bool and refresh the cached copy.

use crate::cache::TtlCache;
use crate::store::SqliteEventStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Cache key holding the full settings map
pub const SITE_CONFIG_KEY: &str = "site-config:all";

/// Setting name to value (NULL values kept as `None`)
pub type SiteConfig = BTreeMap<String, Option<String>>;

#[derive(Clone)]
pub struct SiteSettings {
    store: Arc<SqliteEventStore>,
    cache: Arc<TtlCache<Value>>,
}

impl SiteSettings {
    pub fn new(store: Arc<SqliteEventStore>, cache: Arc<TtlCache<Value>>) -> Self {
        Self { store, cache }
    }

    /// Settings map, from cache unless `force` or stale
    pub async fn load(&self, force: bool) -> SiteConfig {
        if !force {
            if let Some(cached) = self.cache.get(SITE_CONFIG_KEY) {
                match serde_json::from_value::<SiteConfig>(cached) {
                    Ok(config) => return config,
                    Err(e) => warn!(error = %e, "Discarding malformed cached site config"),
                }
            }
        }

        let rows = match self.store.site_config_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Site config load failed");
                return SiteConfig::new();
            }
        };

        let config: SiteConfig = rows.into_iter().collect();
        match serde_json::to_value(&config) {
            Ok(value) => self.cache.set(SITE_CONFIG_KEY, value),
            Err(e) => warn!(error = %e, "Site config not cached"),
        }
        debug!(entries = config.len(), force, "Site config loaded");
        config
    }

    pub async fn all(&self) -> SiteConfig {
        self.load(false).await
    }

    /// Value of one setting; missing and NULL both read as `None`
    pub async fn get(&self, key: &str) -> Option<String> {
        self.load(false).await.remove(key).flatten()
    }

    /// Upsert one setting and reload the cache. `false` means the write failed.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        if let Err(e) = self.store.upsert_site_config(key, value).await {
            error!(error = %e, key, "Site config update failed");
            return false;
        }

        self.load(true).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, SiteSettings, Arc<TtlCache<Value>>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqliteEventStore::open(&dir.path().join("site.db"), StoreConfig::default()).unwrap(),
        );
        let cache = Arc::new(TtlCache::default());
        let settings = SiteSettings::new(store, Arc::clone(&cache));
        (dir, settings, cache)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_dir, settings, _cache) = setup();
        assert_eq!(settings.get("site_name").await, None);

        assert!(settings.set("site_name", "Field Notes").await);
        assert_eq!(settings.get("site_name").await.as_deref(), Some("Field Notes"));

        assert!(settings.set("site_name", "Field Notes II").await);
        assert_eq!(
            settings.get("site_name").await.as_deref(),
            Some("Field Notes II")
        );
    }

    #[tokio::test]
    async fn test_load_populates_cache() {
        let (_dir, settings, cache) = setup();
        settings.set("a", "1").await;
        settings.set("b", "2").await;

        assert!(cache.get(SITE_CONFIG_KEY).is_some());
        let all = settings.all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("b"), Some(&Some("2".to_string())));
    }

    #[tokio::test]
    async fn test_cached_copy_served_until_forced() {
        let (_dir, settings, cache) = setup();
        settings.set("theme", "dark").await;

        // Simulate a stale cached map
        let mut stale = SiteConfig::new();
        stale.insert("theme".to_string(), Some("light".to_string()));
        cache.set(SITE_CONFIG_KEY, serde_json::to_value(&stale).unwrap());

        assert_eq!(settings.get("theme").await.as_deref(), Some("light"));
        let fresh = settings.load(true).await;
        assert_eq!(fresh.get("theme"), Some(&Some("dark".to_string())));
        assert_eq!(settings.get("theme").await.as_deref(), Some("dark"));
    }
}
