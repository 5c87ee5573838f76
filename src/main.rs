//! Object Proxy Cache Server
//!
//! This is the main entry point for the object proxy cache server.
//! It loads configuration, sets up logging, and serves the cache over HTTP.

use anyhow::Context;
use object_proxy_cache::{CacheConfig, CacheMetrics, HttpUpstream, MemoryStore, ObjectProxyCache, ProxyServer};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Main entry point for the object proxy cache server
///
/// # Usage
/// ```bash
/// # Start with default config (object_proxy_cache.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Object Proxy Cache Server");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "object_proxy_cache.yaml".to_string());

    info!("Loading configuration from: {}", config_path);

    let config = match CacheConfig::from_file(&config_path) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  - Origin: {}", cfg.origin_url);
            info!("  - Max TTL: {} seconds", cfg.max_ttl_secs);
            info!("  - Max object size: {} bytes", cfg.max_object_size_bytes);
            info!("  - Collapsed forwarding: {}", cfg.collapsed_forwarding);
            info!(
                "  - Chunking: {} ({} byte chunks)",
                cfg.use_cache_chunking, cfg.byterange_chunk_size
            );
            info!("  - Negative cache: {:?}", cfg.negative_cache);
            info!("  - Path configs: {}", cfg.paths.len());
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure the configuration file exists and is valid");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen_address {}", config.listen_address))?;

    let store = MemoryStore::with_options(config.memory.max_size_bytes, config.memory.reference_passing);
    let upstream = HttpUpstream::new(&config.origin_url, Duration::from_secs(config.upstream_timeout_secs))
        .context("failed to create origin client")?;
    let metrics = CacheMetrics::new().context("failed to register metrics")?;

    let engine = ObjectProxyCache::new(Arc::new(config), Arc::new(store), Arc::new(upstream), metrics);
    info!("Object proxy cache engine created");

    ProxyServer::new(engine, addr)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("server stopped: {}", e))
}
