//! Configuration management for the object proxy cache

use crate::codec::CompressionConfig;
use crate::error::{CacheError, Result};
use crate::key::KeyHasherHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for the object proxy cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Address the HTTP listener binds to (default: "0.0.0.0:8480")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Origin that requests are proxied to (default: "http://127.0.0.1:8080")
    #[serde(default = "default_origin_url")]
    pub origin_url: String,

    /// Prefix of every cache key (default: "opc")
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,

    /// Upper bound of any cache entry's TTL in seconds (default: 86400)
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Freshness lifetime to TTL multiplier for revalidatable objects (default: 2.0)
    #[serde(default = "default_revalidation_factor")]
    pub revalidation_factor: f64,

    /// Largest object the collapsed forwarder will buffer (default: 512KB)
    #[serde(default = "default_max_object_size_bytes")]
    pub max_object_size_bytes: u64,

    /// Media types whose cached documents are compressed
    #[serde(default = "default_compressible_types")]
    pub compressible_types: Vec<String>,

    #[serde(default)]
    pub compression: CompressionConfig,

    /// Status code to cache lifetime (seconds) for error responses
    #[serde(default)]
    pub negative_cache: HashMap<u16, u64>,

    /// Fetch each missing range with its own upstream request
    #[serde(default)]
    pub dearticulate_upstream_ranges: bool,

    /// Treat multi-range client requests as full-object requests
    #[serde(default)]
    pub multipart_ranges_disabled: bool,

    /// Share one upstream fetch between concurrent requests for an object (default: true)
    #[serde(default = "default_true")]
    pub collapsed_forwarding: bool,

    /// Skip per-key locking
    #[serde(default)]
    pub no_lock: bool,

    /// Split stored objects into chunks
    #[serde(default)]
    pub use_cache_chunking: bool,

    /// Bytes per chunk of a byte-range object (default: 64KB)
    #[serde(default = "default_byterange_chunk_size")]
    pub byterange_chunk_size: i64,

    /// Steps per chunk of a time-series object (default: 420)
    #[serde(default = "default_timeseries_chunk_factor")]
    pub timeseries_chunk_factor: i64,

    /// Concurrent chunk lookups per read (default: 16)
    #[serde(default = "default_chunk_concurrency_limit")]
    pub chunk_read_concurrency_limit: usize,

    /// Concurrent chunk writes per write (default: 16)
    #[serde(default = "default_chunk_concurrency_limit")]
    pub chunk_write_concurrency_limit: usize,

    #[serde(default)]
    pub memory: MemoryStoreConfig,

    /// Per-path cache key settings, matched by longest prefix
    #[serde(default)]
    pub paths: Vec<PathConfig>,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

/// Settings of the in-process memory store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStoreConfig {
    /// LRU bound in bytes, unbounded when absent
    #[serde(default)]
    pub max_size_bytes: Option<usize>,

    /// Hand documents out by reference instead of serializing them (default: true)
    #[serde(default = "default_true")]
    pub reference_passing: bool,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: None,
            reference_passing: default_true(),
        }
    }
}

/// Cache key settings for requests under a path prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Query parameters in the key; `["*"]` means all of them
    #[serde(default = "default_cache_key_params")]
    pub cache_key_params: Vec<String>,

    #[serde(default)]
    pub cache_key_headers: Vec<String>,

    /// Body fields of POST/PUT/PATCH requests in the key
    #[serde(default)]
    pub cache_key_form_fields: Vec<String>,

    /// Cache every response under this path for a fixed lifetime
    #[serde(default)]
    pub alternate_cache_ttl_secs: Option<u64>,

    #[serde(skip)]
    pub key_hasher: Option<KeyHasherHandle>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            cache_key_params: default_cache_key_params(),
            cache_key_headers: Vec::new(),
            cache_key_form_fields: Vec::new(),
            alternate_cache_ttl_secs: None,
            key_hasher: None,
        }
    }
}

impl PathConfig {
    pub fn alternate_cache_ttl(&self) -> Option<Duration> {
        self.alternate_cache_ttl_secs.map(Duration::from_secs)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8480".to_string()
}

fn default_origin_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_cache_key_prefix() -> String {
    "opc".to_string()
}

fn default_max_ttl_secs() -> u64 {
    86400
}

fn default_revalidation_factor() -> f64 {
    2.0
}

fn default_max_object_size_bytes() -> u64 {
    524288
}

fn default_compressible_types() -> Vec<String> {
    [
        "text/html",
        "text/javascript",
        "text/css",
        "text/plain",
        "text/xml",
        "text/json",
        "application/json",
        "application/javascript",
        "application/xml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_byterange_chunk_size() -> i64 {
    64 * 1024
}

fn default_timeseries_chunk_factor() -> i64 {
    420
}

fn default_chunk_concurrency_limit() -> usize {
    16
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_cache_key_params() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            origin_url: default_origin_url(),
            cache_key_prefix: default_cache_key_prefix(),
            max_ttl_secs: default_max_ttl_secs(),
            revalidation_factor: default_revalidation_factor(),
            max_object_size_bytes: default_max_object_size_bytes(),
            compressible_types: default_compressible_types(),
            compression: CompressionConfig::default(),
            negative_cache: HashMap::new(),
            dearticulate_upstream_ranges: false,
            multipart_ranges_disabled: false,
            collapsed_forwarding: default_true(),
            no_lock: false,
            use_cache_chunking: false,
            byterange_chunk_size: default_byterange_chunk_size(),
            timeseries_chunk_factor: default_timeseries_chunk_factor(),
            chunk_read_concurrency_limit: default_chunk_concurrency_limit(),
            chunk_write_concurrency_limit: default_chunk_concurrency_limit(),
            memory: MemoryStoreConfig::default(),
            paths: Vec::new(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(CacheConfig)` if loading and validation succeed
    /// * `Err(CacheError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: CacheConfig = serde_yaml::from_str(&content).map_err(|e| {
            CacheError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address and origin_url must not be empty
    /// - revalidation_factor must be at least 1
    /// - max_ttl_secs must be > 0
    /// - byterange_chunk_size and timeseries_chunk_factor must be > 0
    /// - chunk concurrency limits must be > 0
    /// - compression level must suit the algorithm
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            return Err(CacheError::ConfigError(
                "listen_address must not be empty".to_string(),
            ));
        }

        if self.origin_url.is_empty() {
            return Err(CacheError::ConfigError(
                "origin_url must not be empty".to_string(),
            ));
        }

        if !self.revalidation_factor.is_finite() || self.revalidation_factor < 1.0 {
            return Err(CacheError::ConfigError(format!(
                "revalidation_factor must be at least 1, got {}",
                self.revalidation_factor
            )));
        }

        if self.max_ttl_secs == 0 {
            return Err(CacheError::ConfigError(
                "max_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.byterange_chunk_size <= 0 {
            return Err(CacheError::ConfigError(format!(
                "byterange_chunk_size must be greater than 0, got {}",
                self.byterange_chunk_size
            )));
        }

        if self.timeseries_chunk_factor <= 0 {
            return Err(CacheError::ConfigError(format!(
                "timeseries_chunk_factor must be greater than 0, got {}",
                self.timeseries_chunk_factor
            )));
        }

        if self.chunk_read_concurrency_limit == 0 || self.chunk_write_concurrency_limit == 0 {
            return Err(CacheError::ConfigError(
                "chunk concurrency limits must be greater than 0".to_string(),
            ));
        }

        let max_level = match self.compression.algorithm {
            crate::codec::CompressionAlgorithm::None => i32::MAX,
            crate::codec::CompressionAlgorithm::Zstd => 22,
            crate::codec::CompressionAlgorithm::Lz4 => 12,
        };
        if self.compression.level < 0 || self.compression.level > max_level {
            return Err(CacheError::ConfigError(format!(
                "compression level {} out of range for {:?}",
                self.compression.level, self.compression.algorithm
            )));
        }

        if self.upstream_timeout_secs == 0 {
            return Err(CacheError::ConfigError(
                "upstream_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Path configuration with the longest prefix matching `path`
    pub fn path_config(&self, path: &str) -> Option<&PathConfig> {
        self.paths
            .iter()
            .filter(|pc| path.starts_with(&pc.path_prefix))
            .max_by_key(|pc| pc.path_prefix.len())
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn negative_cache_durations(&self) -> HashMap<u16, Duration> {
        self.negative_cache
            .iter()
            .map(|(code, secs)| (*code, Duration::from_secs(*secs)))
            .collect()
    }
}
