//! Lazily loaded, shared test-data cache.
//!
//! Test suites look up data by test case id and field, e.g.
//! `("LOGIN_001", "password")`. Rows are fetched through a [`RowLoader`] on
//! first access and kept for the rest of the run.
//!
//! # Locking
//!
//! ```text
//! get(tc, field)
//!   ├─ read lock ── hit ──────────────────────────────► value
//!   └─ miss ─► write lock ─► re-check ── hit ─────────► value
//!                               └─ miss ─► load_row ─► insert ─► value
//! ```
//!
//! The re-check under the write lock makes concurrent misses on the same row
//! collapse into a single loader call. A field that is still absent after
//! loading is logged and returned as an empty string.

pub mod loader;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::OrchestratorError;

pub use loader::{FileRowLoader, MemoryRowLoader, RowLoader};

/// One test case's fields.
pub type Row = HashMap<String, String>;

static DATA_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{data:(?P<tc>[^.{}]+)\.(?P<field>[^{}]+)\}").expect("valid regex")
});

/// Read-mostly cache of test-data rows.
pub struct CachedDataStore {
    loader: Arc<dyn RowLoader>,
    rows: RwLock<HashMap<String, Row>>,
}

impl CachedDataStore {
    pub fn new(loader: Arc<dyn RowLoader>) -> Self {
        Self {
            loader,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Returns one field of a test case, loading the row on first access.
    ///
    /// Missing rows and fields yield an empty string.
    pub async fn get(&self, test_case_id: &str, field: &str) -> String {
        if let Some(row) = self.rows.read().await.get(test_case_id) {
            return field_or_empty(test_case_id, field, row);
        }

        let mut rows = self.rows.write().await;
        let row = Self::load_locked(&mut rows, self.loader.as_ref(), test_case_id).await;
        field_or_empty(test_case_id, field, row)
    }

    /// Returns a copy of every field of a test case.
    ///
    /// Mutating the returned map never affects the cache.
    pub async fn get_all(&self, test_case_id: &str) -> Row {
        if let Some(row) = self.rows.read().await.get(test_case_id) {
            return row.clone();
        }

        let mut rows = self.rows.write().await;
        Self::load_locked(&mut rows, self.loader.as_ref(), test_case_id)
            .await
            .clone()
    }

    /// Drops every cached row and asks the loader to refresh its source.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let mut rows = self.rows.write().await;
        rows.clear();
        self.loader.refresh().await?;
        debug!("Test data cache cleared");
        Ok(())
    }

    /// Test case ids known to the loader, sorted.
    pub async fn test_case_ids(&self) -> anyhow::Result<Vec<String>> {
        self.loader.test_case_ids().await
    }

    /// Number of cached rows.
    pub async fn cached_rows(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Replaces `{data:<testCase>.<field>}` tokens with cached values.
    pub async fn expand_placeholders(&self, text: &str) -> String {
        let mut values = HashMap::new();
        for caps in DATA_PLACEHOLDER.captures_iter(text) {
            let token = caps[0].to_string();
            if !values.contains_key(&token) {
                let value = self.get(&caps["tc"], &caps["field"]).await;
                values.insert(token, value);
            }
        }

        DATA_PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                values.get(&caps[0]).cloned().unwrap_or_default()
            })
            .into_owned()
    }

    /// Loads `test_case_id` into `rows` unless another task already did.
    ///
    /// A failed load caches an empty row so the source is not hammered.
    async fn load_locked<'a>(
        rows: &'a mut HashMap<String, Row>,
        loader: &dyn RowLoader,
        test_case_id: &str,
    ) -> &'a Row {
        if !rows.contains_key(test_case_id) {
            let row = match loader.load_row(test_case_id).await {
                Ok(row) => {
                    debug!("Loaded {} fields for test case {}", row.len(), test_case_id);
                    row
                }
                Err(e) => {
                    warn!("Failed to load test data for {}: {:#}", test_case_id, e);
                    Row::new()
                }
            };
            rows.insert(test_case_id.to_string(), row);
        }
        &rows[test_case_id]
    }
}

fn field_or_empty(test_case_id: &str, field: &str, row: &Row) -> String {
    match row.get(field) {
        Some(value) => value.clone(),
        None => {
            let err = OrchestratorError::NoDataForKey {
                test_case: test_case_id.to_string(),
                key: field.to_string(),
            };
            warn!("{}", err);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    /// Loader that counts calls and can be slowed down.
    struct CountingLoader {
        inner: MemoryRowLoader,
        loads: AtomicUsize,
        refreshes: AtomicUsize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(delay: Duration) -> Self {
            let mut rows = HashMap::new();
            rows.insert(
                "LOGIN_001".to_string(),
                Row::from([
                    ("username".to_string(), "standard_user".to_string()),
                    ("password".to_string(), "secret_sauce".to_string()),
                ]),
            );
            Self {
                inner: MemoryRowLoader::new(rows),
                loads: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                delay,
            }
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RowLoader for CountingLoader {
        async fn load_row(&self, test_case_id: &str) -> anyhow::Result<Row> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.load_row(test_case_id).await
        }

        async fn refresh(&self) -> anyhow::Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl RowLoader for FailingLoader {
        async fn load_row(&self, _test_case_id: &str) -> anyhow::Result<Row> {
            anyhow::bail!("source offline")
        }
    }

    #[tokio::test]
    async fn test_cold_cache_loads_row_once() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let store = CachedDataStore::new(loader.clone());

        assert_eq!(store.get("LOGIN_001", "password").await, "secret_sauce");
        assert_eq!(loader.loads(), 1);

        assert_eq!(store.get("LOGIN_001", "username").await, "standard_user");
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_missing_field_returns_empty() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let store = CachedDataStore::new(loader.clone());

        assert_eq!(store.get("LOGIN_001", "otp").await, "");
        assert_eq!(store.get("UNKNOWN", "username").await, "");
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn test_loader_failure_returns_empty() {
        let store = CachedDataStore::new(Arc::new(FailingLoader));
        assert_eq!(store.get("LOGIN_001", "password").await, "");
        assert!(store.get_all("LOGIN_001").await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_forces_one_reload() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let store = CachedDataStore::new(loader.clone());

        store.get("LOGIN_001", "password").await;
        store.refresh().await.unwrap();
        assert_eq!(store.cached_rows().await, 0);
        assert_eq!(loader.refreshes.load(Ordering::SeqCst), 1);

        store.get("LOGIN_001", "password").await;
        store.get("LOGIN_001", "username").await;
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn test_get_all_returns_a_copy() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let store = CachedDataStore::new(loader.clone());

        let mut row = store.get_all("LOGIN_001").await;
        assert_eq!(row.len(), 2);
        row.insert("password".to_string(), "changed".to_string());

        assert_eq!(store.get("LOGIN_001", "password").await, "secret_sauce");
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_collapse_into_one_load() {
        let loader = Arc::new(CountingLoader::new(Duration::from_millis(20)));
        let store = Arc::new(CachedDataStore::new(loader.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get("LOGIN_001", "username").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "standard_user");
        }
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_expand_placeholders() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let store = CachedDataStore::new(loader.clone());

        let expanded = store
            .expand_placeholders(
                "-Duser={data:LOGIN_001.username} -Dpass={data:LOGIN_001.password} \
                 -Dx={data:LOGIN_001.missing}",
            )
            .await;

        assert_eq!(
            expanded,
            "-Duser=standard_user -Dpass=secret_sauce -Dx="
        );
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_text_without_placeholders_is_unchanged() {
        let store = CachedDataStore::new(Arc::new(FailingLoader));
        assert_eq!(store.expand_placeholders("{deviceId}").await, "{deviceId}");
    }
}
