use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::browser::BrowserConfig;

/// Application configuration, read from `config.toml` next to the binary.
/// Every field has a default so a missing or partial file still works.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub downloads: DownloadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Number of jobs allowed to run at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Parallel image downloads within one job.
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,
    /// Minimum gap between dispatches against the same source.
    #[serde(default = "default_source_interval_ms")]
    pub source_interval_ms: u64,
    /// Total tries per job, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-series storage cap.
    #[serde(default = "default_budget_mb")]
    pub budget_mb: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: u64,
    #[serde(default = "default_details_ttl_secs")]
    pub details_ttl_secs: u64,
    #[serde(default = "default_pages_ttl_secs")]
    pub pages_ttl_secs: u64,
    /// The durable tier keeps entries this many times longer than the
    /// volatile tier.
    #[serde(default = "default_disk_ttl_multiplier")]
    pub disk_ttl_multiplier: u32,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_max_workers() -> usize {
    1
}

fn default_image_concurrency() -> usize {
    5
}

fn default_source_interval_ms() -> u64 {
    1500
}

fn default_max_attempts() -> u32 {
    2
}

fn default_budget_mb() -> u64 {
    1024
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_search_ttl_secs() -> u64 {
    300
}

fn default_details_ttl_secs() -> u64 {
    900
}

fn default_pages_ttl_secs() -> u64 {
    1800
}

fn default_disk_ttl_multiplier() -> u32 {
    6
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            image_concurrency: default_image_concurrency(),
            source_interval_ms: default_source_interval_ms(),
            max_attempts: default_max_attempts(),
            budget_mb: default_budget_mb(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search_ttl_secs: default_search_ttl_secs(),
            details_ttl_secs: default_details_ttl_secs(),
            pages_ttl_secs: default_pages_ttl_secs(),
            disk_ttl_multiplier: default_disk_ttl_multiplier(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            cache_dir: default_cache_dir(),
            downloads: DownloadConfig::default(),
            cache: CacheConfig::default(),
            browser: BrowserConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to
    /// defaults when the file is missing or malformed.
    pub fn load() -> Self {
        match std::fs::read_to_string("config.toml") {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("invalid config.toml, using defaults: {}", e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub fn source_interval(&self) -> Duration {
        Duration::from_millis(self.downloads.source_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.downloads.retry_backoff_ms)
    }

    pub fn budget_bytes(&self) -> u64 {
        self.downloads.budget_mb * 1024 * 1024
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.search_ttl_secs)
    }

    pub fn details_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.details_ttl_secs)
    }

    pub fn pages_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.pages_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg: Config = toml::from_str("download_dir = \"out\"").unwrap();
        assert_eq!(cfg.download_dir, PathBuf::from("out"));
        assert_eq!(cfg.downloads.max_workers, 1);
        assert_eq!(cfg.downloads.source_interval_ms, 1500);
        assert_eq!(cfg.cache.search_ttl_secs, 300);
    }

    #[test]
    fn budget_converts_to_bytes() {
        let cfg = Config::default();
        assert_eq!(cfg.budget_bytes(), 1024 * 1024 * 1024);
    }
}
