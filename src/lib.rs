//! Object Proxy Cache
//!
//! An HTTP caching engine that sits between clients and a single origin and
//! caches whole objects as well as the byte ranges clients ask for.
//!
//! # Overview
//!
//! Each request is keyed, looked up under a per-key read lock, and driven
//! through a small state machine. Cached documents can hold a sparse set of
//! byte ranges; a request for ranges the cache partially holds only fetches
//! what is missing from the origin and merges it into the cached document.
//! Stale documents with validators are revalidated with conditional
//! requests, and concurrent misses for the same object share one origin
//! fetch through a collapsed forwarder.
//!
//! # Features
//!
//! - **Byte-range caching**: partial hits fetch only the missing ranges
//! - **Multipart reconstruction**: `multipart/byteranges` bodies are parsed and built
//! - **HTTP caching policy**: `Cache-Control`, `Expires`, validators and heuristic freshness
//! - **Revalidation**: `If-None-Match`/`If-Modified-Since` against the origin
//! - **Collapsed forwarding**: one origin fetch streamed to many clients
//! - **Chunked storage**: large objects stored as fixed-size byte-range chunks
//! - **Negative caching**: error statuses cached for configured durations
//! - **Metrics**: Prometheus counters for lookups, origin fetches and writes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use object_proxy_cache::{CacheConfig, CacheMetrics, ClientRequest, HttpUpstream, MemoryStore, ObjectProxyCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::from_file("object_proxy_cache.yaml")?;
//! let upstream = HttpUpstream::new(&config.origin_url, Duration::from_secs(config.upstream_timeout_secs))?;
//! let engine = ObjectProxyCache::new(
//!     Arc::new(config),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(upstream),
//!     CacheMetrics::new()?,
//! );
//!
//! let request = ClientRequest::new(http::Method::GET, "/video.mp4".parse()?)
//!     .with_header("range", "bytes=0-1023");
//! let response = engine.handle(request).await;
//! println!("{} {:?}", response.status, response.result_header());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ObjectProxyCache`]: the engine and its request state machine
//! - [`ProxyRequest`]: per-request state, origin request building and response rendering
//! - [`query_cache`] / [`write_cache`]: cache reads and writes, chunked or whole
//! - [`ByteRanges`]: byte-range interval algebra
//! - [`RangeParts`]: sparse content and multipart bodies
//! - [`CachingPolicy`]: freshness and client conditionals
//! - [`CollapsedForwarder`]: one producer, many readers of an origin response
//! - [`CacheStore`]: storage backends, with [`MemoryStore`] built in
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file:
//!
//! ```yaml
//! listen_address: "0.0.0.0:8480"
//! origin_url: "http://127.0.0.1:8080"
//! max_ttl_secs: 86400
//! revalidation_factor: 2.0
//! negative_cache:
//!   404: 30
//! use_cache_chunking: true
//! byterange_chunk_size: 65536
//! paths:
//!   - path_prefix: "/api/"
//!     cache_key_params: ["id"]
//! ```
//!
//! See [`CacheConfig`] for every option.

pub mod cache;
pub mod chunks;
pub mod codec;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod key;
pub mod locks;
pub mod metrics;
pub mod multipart;
pub mod policy;
pub mod pool;
pub mod proxy_request;
pub mod ranges;
pub mod server;
pub mod status;
pub mod storage;
pub mod timeseries;
pub mod upstream;

// Re-export commonly used types
pub use cache::{purge_cache, query_cache, write_cache, CacheLookup, CacheOptions, TimeseriesContext};
pub use codec::{CompressionAlgorithm, CompressionConfig};
pub use config::{CacheConfig, MemoryStoreConfig, PathConfig};
pub use document::HttpDocument;
pub use engine::{FetchResult, ObjectProxyCache};
pub use error::{CacheError, Result};
pub use forwarder::{CollapsedForwarder, ForwarderReader, ForwarderRegistry};
pub use key::{derive_cache_key, KeyHasher, KeyHasherHandle, KeyRequest};
pub use locks::{NamedLock, NamedLocker, UpgradeOutcome};
pub use metrics::CacheMetrics;
pub use multipart::{RangePart, RangeParts};
pub use policy::CachingPolicy;
pub use proxy_request::{ClientRequest, ProxyRequest, ProxyResponse, ResponseBody};
pub use ranges::{ByteRange, ByteRanges};
pub use server::ProxyServer;
pub use status::{merge_result_header_vals, set_result_header, LookupStatus};
pub use storage::{CacheStore, MemoryStore, ReferenceStore};
pub use timeseries::{Extent, ExtentList, TimeRangeQuery, Timeseries};
pub use upstream::{HttpUpstream, Upstream, UpstreamRequest, UpstreamResponse};
