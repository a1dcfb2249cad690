// rust/ptfu-core/src/config.rs

//! Configuration management for the dataset toolkit.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DatasetError, Result};

/// Compression algorithms accepted for disk cache entries.
pub const VALID_COMPRESSION: [&str; 3] = ["none", "lz4", "zstd"];

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PtfuConfig {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub reader: ReaderConfig,
    pub queue: QueueConfig,
    pub creator: CreatorConfig,
    pub feeder: FeederConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Buffer size in bytes for file-backed source streams.
    pub buffer_size: usize,
    // Whether to memory-map large archive files.
    pub use_mmap: bool,
    // File size threshold above which to use mmap.
    pub mmap_threshold: u64,
}

/// Reader cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep decoded records in an in-process memory cache.
    pub memory: bool,
    /// Use a temporary-directory disk cache for sources that support it.
    pub disk: bool,
    /// Also persist decoded records read from the source into the disk cache.
    pub persist_decoded: bool,
    /// Compression for disk cache entries: "none", "lz4", or "zstd".
    pub compression: String,
    /// Compression level (zstd only).
    pub compression_level: i32,
}

// Bulk read configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    // Number of partition workers; half the CPUs when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    // Names are split into partitions only when there are at least
    // `partition_factor` times as many names as workers.
    pub partition_factor: usize,
}

// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    // How long a consumer blocks on an empty queue before re-checking
    // whether more items are expected.
    pub pop_timeout_ms: u64,
}

/// Dataset creation pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatorConfig {
    /// Number of filter threads; half the CPUs when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_workers: Option<usize>,
    /// Interval between progress reports while writing.
    pub monitor_interval_ms: u64,
}

/// Minibatch feeder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    /// Records per minibatch.
    pub batch_size: usize,
    /// Number of minibatches buffered ahead of the consumer.
    pub capacity: usize,
    /// Optional seed for reproducible sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: true,
            disk: true,
            persist_decoded: true,
            compression: "lz4".to_string(),
            compression_level: 1,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            partition_factor: 10,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { pop_timeout_ms: 100 }
    }
}

impl Default for CreatorConfig {
    fn default() -> Self {
        Self {
            filter_workers: None,
            monitor_interval_ms: 1000,
        }
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            capacity: 4,
            seed: None,
        }
    }
}

/// Half the available CPUs, at least one.
pub fn half_cpus() -> usize {
    (num_cpus::get() / 2).max(1)
}

impl ReaderConfig {
    /// Resolves the partition worker count.
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(half_cpus).max(1)
    }
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

impl CreatorConfig {
    /// Resolves the filter thread count.
    pub fn filter_workers(&self) -> usize {
        self.filter_workers.unwrap_or_else(half_cpus).max(1)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl FromStr for PtfuConfig {
    type Err = DatasetError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| DatasetError::config_with_source("failed to parse TOML config", e))
    }
}

impl PtfuConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DatasetError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `PTFU_` and use underscores
    // to separate nested fields. For example:
    // - `PTFU_STORAGE_BUFFER_SIZE` overrides `storage.buffer_size`
    // - `PTFU_CACHE_DISK` overrides `cache.disk`
    // - `PTFU_READER_MAX_WORKERS` overrides `reader.max_workers`
    // - `PTFU_FEEDER_SEED` overrides `feeder.seed`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("PTFU_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Cache overrides
        if let Ok(val) = std::env::var("PTFU_CACHE_MEMORY") {
            if let Ok(v) = val.parse() {
                self.cache.memory = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_CACHE_DISK") {
            if let Ok(v) = val.parse() {
                self.cache.disk = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_CACHE_PERSIST_DECODED") {
            if let Ok(v) = val.parse() {
                self.cache.persist_decoded = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_CACHE_COMPRESSION") {
            self.cache.compression = val;
        }
        if let Ok(val) = std::env::var("PTFU_CACHE_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.cache.compression_level = v;
            }
        }

        // Reader overrides
        if let Ok(val) = std::env::var("PTFU_READER_MAX_WORKERS") {
            if let Ok(v) = val.parse() {
                self.reader.max_workers = Some(v);
            }
        }
        if let Ok(val) = std::env::var("PTFU_READER_PARTITION_FACTOR") {
            if let Ok(v) = val.parse() {
                self.reader.partition_factor = v;
            }
        }

        // Queue overrides
        if let Ok(val) = std::env::var("PTFU_QUEUE_POP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.queue.pop_timeout_ms = v;
            }
        }

        // Creator overrides
        if let Ok(val) = std::env::var("PTFU_CREATOR_FILTER_WORKERS") {
            if let Ok(v) = val.parse() {
                self.creator.filter_workers = Some(v);
            }
        }
        if let Ok(val) = std::env::var("PTFU_CREATOR_MONITOR_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.creator.monitor_interval_ms = v;
            }
        }

        // Feeder overrides
        if let Ok(val) = std::env::var("PTFU_FEEDER_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.feeder.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_FEEDER_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.feeder.capacity = v;
            }
        }
        if let Ok(val) = std::env::var("PTFU_FEEDER_SEED") {
            if let Ok(v) = val.parse() {
                self.feeder.seed = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(DatasetError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        if !VALID_COMPRESSION.contains(&self.cache.compression.as_str()) {
            return Err(DatasetError::config(format!(
                "cache.compression must be one of: {}",
                VALID_COMPRESSION.join(", ")
            )));
        }

        if self.reader.max_workers == Some(0) {
            return Err(DatasetError::config(
                "reader.max_workers must be greater than 0",
            ));
        }
        if self.reader.partition_factor == 0 {
            return Err(DatasetError::config(
                "reader.partition_factor must be greater than 0",
            ));
        }

        if self.queue.pop_timeout_ms == 0 {
            return Err(DatasetError::config(
                "queue.pop_timeout_ms must be greater than 0",
            ));
        }

        if self.creator.filter_workers == Some(0) {
            return Err(DatasetError::config(
                "creator.filter_workers must be greater than 0",
            ));
        }
        if self.creator.monitor_interval_ms == 0 {
            return Err(DatasetError::config(
                "creator.monitor_interval_ms must be greater than 0",
            ));
        }

        if self.feeder.batch_size == 0 {
            return Err(DatasetError::config(
                "feeder.batch_size must be greater than 0",
            ));
        }
        if self.feeder.capacity == 0 {
            return Err(DatasetError::config(
                "feeder.capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PtfuConfig::default();

        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 1024 * 1024);

        assert!(config.cache.memory);
        assert!(config.cache.disk);
        assert!(config.cache.persist_decoded);
        assert_eq!(config.cache.compression, "lz4");
        assert_eq!(config.cache.compression_level, 1);

        assert!(config.reader.max_workers.is_none());
        assert_eq!(config.reader.partition_factor, 10);

        assert_eq!(config.queue.pop_timeout_ms, 100);

        assert!(config.creator.filter_workers.is_none());
        assert_eq!(config.creator.monitor_interval_ms, 1000);

        assert_eq!(config.feeder.batch_size, 32);
        assert_eq!(config.feeder.capacity, 4);
        assert!(config.feeder.seed.is_none());
    }

    #[test]
    fn test_default_validates() {
        let config = PtfuConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: PtfuConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [cache]
            disk = false
            compression = "zstd"
        "#;
        let config: PtfuConfig = toml.parse().unwrap();

        assert!(!config.cache.disk);
        assert_eq!(config.cache.compression, "zstd");
        // Other cache fields should be defaults
        assert!(config.cache.memory);
        // Other sections should be defaults
        assert_eq!(config.reader.partition_factor, 10);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 4096

            [cache]
            memory = false
            disk = true
            persist_decoded = false
            compression = "none"
            compression_level = 3

            [reader]
            max_workers = 6
            partition_factor = 4

            [queue]
            pop_timeout_ms = 20

            [creator]
            filter_workers = 3
            monitor_interval_ms = 250

            [feeder]
            batch_size = 16
            capacity = 8
            seed = 42
        "#;

        let config: PtfuConfig = toml.parse().unwrap();

        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 4096);
        assert!(!config.cache.memory);
        assert!(config.cache.disk);
        assert!(!config.cache.persist_decoded);
        assert_eq!(config.cache.compression, "none");
        assert_eq!(config.cache.compression_level, 3);
        assert_eq!(config.reader.max_workers, Some(6));
        assert_eq!(config.reader.workers(), 6);
        assert_eq!(config.reader.partition_factor, 4);
        assert_eq!(config.queue.pop_timeout(), Duration::from_millis(20));
        assert_eq!(config.creator.filter_workers(), 3);
        assert_eq!(config.creator.monitor_interval(), Duration::from_millis(250));
        assert_eq!(config.feeder.batch_size, 16);
        assert_eq!(config.feeder.capacity, 8);
        assert_eq!(config.feeder.seed, Some(42));
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<PtfuConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [reader]
            max_workers = 2
            "#
        )
        .unwrap();

        let config = PtfuConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reader.max_workers, Some(2));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = PtfuConfig::from_file("/nonexistent/ptfu.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_invalid_buffer_size() {
        let mut config = PtfuConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_compression() {
        let mut config = PtfuConfig::default();
        config.cache.compression = "gzip".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cache.compression"));
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = PtfuConfig::default();
        config.reader.max_workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = PtfuConfig::default();
        config.creator.filter_workers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_feeder() {
        let mut config = PtfuConfig::default();
        config.feeder.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = PtfuConfig::default();
        config.feeder.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_counts_never_zero() {
        let config = PtfuConfig::default();
        assert!(config.reader.workers() >= 1);
        assert!(config.creator.filter_workers() >= 1);
        assert!(half_cpus() >= 1);
    }

    // Helper to clear all PTFU_ environment variables for test isolation
    fn clear_ptfu_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("PTFU_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_ptfu_env_vars();

        std::env::set_var("PTFU_STORAGE_BUFFER_SIZE", "32768");
        std::env::set_var("PTFU_CACHE_DISK", "false");
        std::env::set_var("PTFU_CACHE_COMPRESSION", "zstd");
        std::env::set_var("PTFU_READER_MAX_WORKERS", "3");
        std::env::set_var("PTFU_FEEDER_SEED", "12345");

        let config = PtfuConfig::default().with_env_overrides();

        assert_eq!(config.storage.buffer_size, 32768);
        assert!(!config.cache.disk);
        assert_eq!(config.cache.compression, "zstd");
        assert_eq!(config.reader.max_workers, Some(3));
        assert_eq!(config.feeder.seed, Some(12345));

        clear_ptfu_env_vars();

        // Invalid values should be ignored (keep defaults)
        std::env::set_var("PTFU_STORAGE_BUFFER_SIZE", "not_a_number");

        let config = PtfuConfig::default().with_env_overrides();
        assert_eq!(config.storage.buffer_size, 64 * 1024);

        clear_ptfu_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = PtfuConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: PtfuConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.buffer_size, parsed.storage.buffer_size);
        assert_eq!(original.cache.compression, parsed.cache.compression);
        assert_eq!(original.reader.partition_factor, parsed.reader.partition_factor);
        assert_eq!(original.feeder.batch_size, parsed.feeder.batch_size);
    }
}
