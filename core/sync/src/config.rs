//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tether_common::{Error, Result};

use crate::cache::CachePolicy;
use crate::executor::ExecutorConfig;
use crate::scheduler::SyncMode;

/// Configuration for the resilient client.
///
/// Stored as JSON. Every field has a default, so a partial file (or `{}`)
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: u64,
    /// Attempts per interactive request, including the first.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `2^n * backoff_base_ms`.
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_backoff_ms: u64,
    /// Randomize backoff delays by +/- 25%.
    pub jitter: bool,
    /// Age after which a cached response is stale.
    pub staleness_secs: u64,
    /// Whether GET responses are cached and served from cache.
    pub cache_enabled: bool,
    /// Cache growth policy.
    pub cache_policy: CachePolicy,
    /// When the pending mutation queue is drained.
    pub sync_mode: SyncMode,
    /// Base URL for relative request URLs.
    pub base_url: Option<String>,
    /// User-Agent override.
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter: false,
            staleness_secs: 300,
            cache_enabled: true,
            cache_policy: CachePolicy::Unbounded,
            sync_mode: SyncMode::OnReconnect,
            base_url: None,
            user_agent: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - JSON is malformed
    /// - Values fail validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".to_string()));
        }
        if let CachePolicy::Bounded { max_entries: 0 } = self.cache_policy {
            return Err(Error::Config(
                "bounded cache needs max_entries of at least 1".to_string(),
            ));
        }
        self.staleness()?;
        if let SyncMode::Hybrid { interval } = self.sync_mode {
            if interval.is_zero() {
                return Err(Error::Config("sync interval must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new(self.max_attempts)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_backoff_base(Duration::from_millis(self.backoff_base_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_jitter(self.jitter)
    }

    /// Staleness horizon of cached responses.
    ///
    /// # Errors
    /// - `staleness_secs` does not fit a `chrono::Duration`
    pub fn staleness(&self) -> Result<chrono::Duration> {
        i64::try_from(self.staleness_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                Error::Config(format!(
                    "staleness_secs out of range: {}",
                    self.staleness_secs
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.staleness().unwrap(), chrono::Duration::seconds(300));
        assert!(config.cache_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.sync_mode, SyncMode::OnReconnect);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf").join("tether.json");

        let config = ClientConfig {
            cache_policy: CachePolicy::Bounded { max_entries: 64 },
            base_url: Some("https://api.example.com".to_string()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        std::fs::write(&path, r#"{"max_attempts": 0}"#).unwrap();
        assert!(matches!(ClientConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range_staleness() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stale.json");

        for secs in ["18446744073709551615", "10000000000000000"] {
            std::fs::write(&path, format!(r#"{{"staleness_secs": {}}}"#, secs)).unwrap();
            assert!(matches!(ClientConfig::load(&path), Err(Error::Config(_))));
        }

        let largest = ClientConfig {
            staleness_secs: (i64::MAX / 1000) as u64,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
        assert!(largest.staleness().unwrap() > chrono::Duration::zero());
    }

    #[test]
    fn test_executor_config_mapping() {
        let config = ClientConfig {
            timeout_ms: 2_500,
            max_attempts: 4,
            ..Default::default()
        };
        let exec = config.executor_config();
        assert_eq!(exec.max_attempts, 4);
        assert_eq!(exec.timeout, Duration::from_millis(2_500));
        assert_eq!(exec.delay_for_attempt(1), Duration::from_secs(2));
    }
}
