//! Sync layer configuration.
//!
//! Holds the backend location, the deadlines applied at every suspension
//! point, and the cache eviction limits.
//!
//! Configuration is stored at `~/.config/rentcache/config.json`. A missing
//! file yields the defaults; `RENTCACHE_BACKEND_URL` and `RENTCACHE_API_KEY`
//! override the file when set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Application name used for config directory paths
const APP_NAME: &str = "rentcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Per-request HTTP timeout, above the fetch and mutation deadlines so the
/// sync layer's own deadline fires first.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Deadline for a single cache fetch.
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;

/// Deadline for the network half of an optimistic mutation.
/// Keys stay `pending` at most this long before rolling back.
const DEFAULT_MUTATION_TIMEOUT_SECS: u64 = 20;

/// Entries older than this are served but refetched by `query`.
const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;

/// Unobserved entries idle this long are evicted.
const DEFAULT_IDLE_TTL_SECS: u64 = 30 * 60;

const DEFAULT_MAX_ENTRIES: usize = 512;

const ENV_BACKEND_URL: &str = "RENTCACHE_BACKEND_URL";
const ENV_API_KEY: &str = "RENTCACHE_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub mutation_timeout_secs: u64,
    pub cache: CacheConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            mutation_timeout_secs: DEFAULT_MUTATION_TIMEOUT_SECS,
            cache: CacheConfig::default(),
        }
    }
}

/// Cache staleness and eviction limits. A value of 0 disables the limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub stale_after_secs: u64,
    pub idle_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl CacheConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        non_zero_secs(self.stale_after_secs)
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        non_zero_secs(self.idle_ttl_secs)
    }

    pub fn max_entries(&self) -> Option<usize> {
        (self.max_entries > 0).then_some(self.max_entries)
    }
}

impl SyncConfig {
    /// Load from the config directory, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            debug!(path = %path.display(), "Loaded sync config");
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_BACKEND_URL) {
            if !url.is_empty() {
                self.backend_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.fetch_timeout_secs)
    }

    pub fn mutation_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.mutation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"backend_url": "https://db.example.com", "cache": {"max_entries": 8}}"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.backend_url.as_deref(), Some("https://db.example.com"));
        assert_eq!(config.cache.max_entries(), Some(8));
        assert_eq!(config.cache.idle_ttl_secs, DEFAULT_IDLE_TTL_SECS);
        assert_eq!(config.fetch_timeout(), Some(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)));
    }

    #[test]
    fn test_zero_disables_limits() {
        let config = SyncConfig {
            mutation_timeout_secs: 0,
            cache: CacheConfig {
                stale_after_secs: 0,
                idle_ttl_secs: 0,
                max_entries: 0,
            },
            ..SyncConfig::default()
        };

        assert_eq!(config.mutation_timeout(), None);
        assert_eq!(config.cache.stale_after(), None);
        assert_eq!(config.cache.idle_ttl(), None);
        assert_eq!(config.cache.max_entries(), None);
    }

    #[test]
    fn test_load_from_missing_file_is_default() {
        let path = std::env::temp_dir().join("rentcache-missing-config-test.json");
        let config = SyncConfig::load_from(&path).unwrap();
        assert!(config.backend_url.is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
    }
}
