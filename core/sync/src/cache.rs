//! Response cache for GET requests with a staleness horizon.

use blake2::{Blake2s256, Digest};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tether_common::Result;
use tether_storage::KeyValueStore;

use crate::clock::{Clock, SystemClock};

/// Storage key of the list of cached request signatures.
const INDEX_KEY: &str = "tether/cache-index";
/// Prefix of per-entry storage keys.
const ENTRY_PREFIX: &str = "tether/cache/";

/// The most recent successful response for one request signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request signature (`METHOD:url:body`).
    pub key: String,
    /// Response payload.
    pub data: Value,
    /// When the response was stored.
    pub stored_at: DateTime<Utc>,
}

/// How the cache bounds its growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachePolicy {
    /// One entry per distinct signature, kept until overwritten.
    #[default]
    Unbounded,
    /// At most `max_entries`; inserting past the bound evicts the entry
    /// with the oldest `stored_at`.
    Bounded { max_entries: usize },
}

/// Keyed store of successful GET responses.
///
/// Entries are mirrored to durable storage and loaded back on open, so a
/// restarted client can still serve stale data while offline.
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    horizon: Duration,
    policy: CachePolicy,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    /// Open the cache, loading persisted entries from `store`.
    ///
    /// Entries that fail to parse are dropped with a warning.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        horizon: Duration,
        policy: CachePolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let keys: Vec<String> = match store.get(INDEX_KEY).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Discarding unreadable cache index: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut entries = HashMap::new();
        for key in keys {
            let Some(json) = store.get(&Self::storage_key(&key)).await? else {
                continue;
            };
            match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => warn!("Discarding unreadable cache entry {}: {}", key, e),
            }
        }
        debug!("Loaded {} cached responses", entries.len());

        Ok(Self {
            store,
            clock,
            horizon,
            policy,
            entries: RwLock::new(entries),
        })
    }

    /// Open with the system clock and no size bound.
    pub async fn open_default(store: Arc<dyn KeyValueStore>, horizon: Duration) -> Result<Self> {
        Self::open(store, horizon, CachePolicy::Unbounded, Arc::new(SystemClock)).await
    }

    /// Storage key for a request signature.
    fn storage_key(key: &str) -> String {
        let digest = Blake2s256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}{}", ENTRY_PREFIX, hex)
    }

    /// Look up the entry for `key`.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store `data` under `key`, replacing any existing entry.
    pub async fn put(&self, key: &str, data: Value) -> Result<CacheEntry> {
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            stored_at: self.clock.now(),
        };

        let mut entries = self.entries.write().await;
        self.store
            .set(&Self::storage_key(key), &serde_json::to_string(&entry)?)
            .await?;
        let is_new = entries.insert(key.to_string(), entry.clone()).is_none();

        let evicted = self.evict(&mut entries, key);
        for key in &evicted {
            debug!("Evicting cached response {}", key);
            self.store.remove(&Self::storage_key(key)).await?;
        }

        if is_new || !evicted.is_empty() {
            self.persist_index(&entries).await?;
        }
        Ok(entry)
    }

    /// Whether `entry` is younger than the staleness horizon.
    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        self.clock.now() - entry.stored_at < self.horizon
    }

    /// Remove the entry for `key`, if any.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.store.remove(&Self::storage_key(key)).await?;
            self.persist_index(&entries).await?;
        }
        Ok(())
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        for key in entries.keys() {
            self.store.remove(&Self::storage_key(key)).await?;
        }
        entries.clear();
        self.store.remove(INDEX_KEY).await
    }

    /// Number of cached responses.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Staleness horizon.
    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Apply the size policy, returning the evicted keys. `keep` is never
    /// evicted.
    fn evict(&self, entries: &mut HashMap<String, CacheEntry>, keep: &str) -> Vec<String> {
        let CachePolicy::Bounded { max_entries } = self.policy else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while entries.len() > max_entries {
            let oldest = entries
                .values()
                .filter(|e| e.key != keep)
                .min_by_key(|e| e.stored_at)
                .map(|e| e.key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    async fn persist_index(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        self.store
            .set(INDEX_KEY, &serde_json::to_string(&keys)?)
            .await
    }
}
