//! In-memory key-value store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::provider::KeyValueStore;
use tether_common::{Error, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same underlying map, which lets a
/// test "restart" a component on top of the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned<T>(_: T) -> Error {
        Error::Storage("Memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let storage = self.storage.read().map_err(Self::poisoned)?;
        Ok(storage.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut storage = self.storage.write().map_err(Self::poisoned)?;
        storage.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut storage = self.storage.write().map_err(Self::poisoned)?;
        storage.remove(key);
        Ok(())
    }
}
