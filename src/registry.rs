//! Process-owned registry of open stores.
//!
//! Maps a database path to its [`Store`] so that every component of a process
//! shares one pool per database. Lookups are lock-free; opening a new store is
//! serialized and re-checked under the lock so concurrent callers never open
//! two pools for the same path.

use tokio::sync::Mutex;

use crate::{config::Config, error::Error, store::Store};

pub struct Registry {
    stores: papaya::HashMap<String, Store>,
    opening: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            stores: papaya::HashMap::new(),
            opening: Mutex::new(()),
        }
    }

    /// Returns the store for `config.db_path()`, opening it on first use.
    ///
    /// Stores are keyed by path alone: the pool settings of the first config
    /// to open a path win, and `max_connections` of later configs is ignored.
    pub async fn get(&self, config: &Config) -> Result<Store, Error> {
        let path = config.db_path();

        if let Some(store) = self.lookup(path) {
            return Ok(store);
        }

        let _opening = self.opening.lock().await;

        // Another caller may have opened it while we waited for the lock.
        if let Some(store) = self.lookup(path) {
            return Ok(store);
        }

        let store = Store::open(config).await?;
        {
            let guard = self.stores.guard();
            self.stores.insert(path.to_owned(), store.clone(), &guard);
        }

        tracing::debug!(path, "Opened outbox store");

        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, path: &str) -> Option<Store> {
        let guard = self.stores.guard();
        self.stores.get(path, &guard).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn config_for(dir: &tempfile::TempDir, name: &str) -> Config {
        Config {
            db_path: Some(dir.path().join(name).to_string_lossy().to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reuses_store_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        assert!(registry.is_empty());

        let a = config_for(&dir, "a.db");
        registry.get(&a).await.unwrap();
        registry.get(&a).await.unwrap();
        assert_eq!(registry.len(), 1);

        registry.get(&config_for(&dir, "b.db")).await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_open_creates_one_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let config = config_for(&dir, "shared.db");

        let handles = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let config = config.clone();
                tokio::spawn(async move { registry.get(&config).await.map(|_| ()) })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(registry.len(), 1);
    }
}
