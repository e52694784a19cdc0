//! Durable key-value store trait definition.

use async_trait::async_trait;

use tether_common::Result;

/// Durable key-value storage for string blobs.
///
/// Implementations must survive process restarts (except test stores) and
/// must be safe to share between tasks. Callers serialize their own writes
/// when they need read-modify-write atomicity.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "file", "memory").
    fn name(&self) -> &str;

    /// Read the blob stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing is stored under the key.
    ///
    /// # Errors
    /// - I/O or backend failures
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous blob.
    ///
    /// # Postconditions
    /// - A subsequent `get(key)` returns `value`, also after a restart
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the blob under `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Check if a key is present.
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
