//! Cache reads and writes for HTTP documents
//!
//! [`query_cache`] looks a document up, reassembles chunked objects and
//! works out which byte ranges are still missing. [`write_cache`] prepares a
//! document for storage and writes it whole or as chunks.

use crate::chunks::{self, chunk_key};
use crate::codec::CompressionConfig;
use crate::config::CacheConfig;
use crate::document::HttpDocument;
use crate::error::{CacheError, Result};
use crate::headers::{self, CONTENT_ENCODING, CONTENT_RANGE, DATE, RESULT_HEADER, TRANSFER_ENCODING};
use crate::multipart::{RangePart, RangeParts};
use crate::ranges::{ByteRange, ByteRanges};
use crate::status::LookupStatus;
use crate::storage::CacheStore;
use crate::timeseries::{MarshalerFn, TimeRangeQuery, UnmarshalerFn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Storage behaviour shared by reads and writes
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub use_chunking: bool,
    pub byterange_chunk_size: i64,
    pub timeseries_chunk_factor: i64,
    pub read_concurrency: usize,
    pub write_concurrency: usize,
    /// Media types (without parameters) whose documents are compressed
    pub compressible_types: HashSet<String>,
    pub compression: CompressionConfig,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        CacheOptions {
            use_chunking: config.use_cache_chunking,
            byterange_chunk_size: config.byterange_chunk_size,
            timeseries_chunk_factor: config.timeseries_chunk_factor,
            read_concurrency: config.chunk_read_concurrency_limit,
            write_concurrency: config.chunk_write_concurrency_limit,
            compressible_types: config
                .compressible_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            compression: config.compression.clone(),
        }
    }
}

/// Time-series request context for chunking by time
#[derive(Clone)]
pub struct TimeseriesContext {
    pub query: TimeRangeQuery,
    pub marshal: Option<MarshalerFn>,
    pub unmarshal: Option<UnmarshalerFn>,
}

impl std::fmt::Debug for TimeseriesContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesContext")
            .field("query", &self.query)
            .field("marshal", &self.marshal.is_some())
            .field("unmarshal", &self.unmarshal.is_some())
            .finish()
    }
}

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub document: HttpDocument,
    pub status: LookupStatus,
    /// Wanted ranges the cached document cannot serve
    pub delta: ByteRanges,
    /// Set when the lookup failed; a missing key is `KeyNotFound`
    pub error: Option<CacheError>,
}

impl CacheLookup {
    fn miss(wanted: &ByteRanges, error: CacheError) -> Self {
        CacheLookup {
            document: HttpDocument::default(),
            status: LookupStatus::KeyMiss,
            delta: wanted.clone(),
            error: Some(error),
        }
    }
}

/// Look up `key`, reassembling chunks and computing the range delta
///
/// A cached partial document queried without ranges is queried for the whole
/// object instead. A delta equal to the wanted ranges is a `RangeMiss`; any
/// other non-empty delta a `PartialHit`. Unreadable entries are a `KeyMiss`
/// carrying the decode error.
pub async fn query_cache(
    store: &Arc<dyn CacheStore>,
    key: &str,
    wanted: &ByteRanges,
    opts: &CacheOptions,
    ts: Option<&TimeseriesContext>,
) -> CacheLookup {
    let mut doc = match chunks::fetch_document(store.as_ref(), key).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return CacheLookup::miss(wanted, CacheError::KeyNotFound),
        Err(e) => {
            warn!("Cache entry unreadable: key={}, error={}", key, e);
            return CacheLookup::miss(wanted, e);
        }
    };

    if doc.is_meta && opts.use_chunking {
        let assembled = match ts {
            Some(ts) => chunks::read_timeseries_chunks(
                store,
                key,
                &mut doc,
                &ts.query,
                ts.unmarshal.as_ref(),
                opts.timeseries_chunk_factor,
                opts.read_concurrency,
            )
            .await,
            None => chunks::read_byterange_chunks(
                store,
                key,
                &mut doc,
                wanted,
                opts.byterange_chunk_size,
                opts.read_concurrency,
            )
            .await
            .map(|filled| !filled.is_empty()),
        };
        match assembled {
            Ok(true) => {}
            Ok(false) => {
                debug!("No chunks found for meta document: key={}", key);
                return CacheLookup::miss(wanted, CacheError::KeyNotFound);
            }
            Err(e) => return CacheLookup::miss(wanted, e),
        }
    } else if let Some(unmarshal) = ts.and_then(|t| t.unmarshal.as_ref()) {
        if doc.timeseries.is_none() && !doc.body.is_empty() {
            match unmarshal(&doc.body, ts.map(|t| &t.query)) {
                Ok(series) => doc.timeseries = Some(series),
                Err(e) => return CacheLookup::miss(wanted, e),
            }
        }
    }

    doc.is_fulfillment = !doc.ranges.is_empty() && wanted.is_empty();
    let wants = if doc.is_fulfillment {
        debug!("Cache fulfillment: key={}, content_length={}", key, doc.content_length);
        ByteRanges(vec![ByteRange::new(0, doc.content_length - 1)])
    } else {
        wanted.clone()
    };

    let mut status = LookupStatus::Hit;
    let mut delta = ByteRanges::default();
    if !wants.is_empty() && !doc.ranges.is_empty() {
        delta = wants.calculate_delta(&doc.ranges, doc.content_length);
        if !delta.is_empty() {
            status = if delta.same_as(&wants.resolve(doc.content_length)) || delta.same_as(&wants) {
                LookupStatus::RangeMiss
            } else {
                LookupStatus::PartialHit
            };
        }
    }

    debug!("Cache lookup: key={}, status={}, delta={}", key, status, delta);
    CacheLookup {
        document: doc,
        status,
        delta,
        error: None,
    }
}

/// Whether a document of this type should be compressed in storage
fn should_compress(doc: &HttpDocument, compressible_types: &HashSet<String>) -> bool {
    let encoding = headers::get_str(&doc.headers, CONTENT_ENCODING).unwrap_or_default();
    if !(encoding.is_empty() || encoding.eq_ignore_ascii_case("identity")) {
        return false;
    }
    if doc.caching_policy.no_transform {
        return false;
    }
    let media_type = doc
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    compressible_types.contains(&media_type)
}

/// Write a document to the cache
///
/// Per-response headers are stripped first. With chunking enabled, objects
/// of known length are split into byte-range chunks (or time chunks when a
/// time-series context is given) plus a meta document at `key`.
pub async fn write_cache(
    store: &Arc<dyn CacheStore>,
    key: &str,
    doc: &mut HttpDocument,
    ttl: Duration,
    opts: &CacheOptions,
    ts: Option<&TimeseriesContext>,
) -> Result<()> {
    for name in [DATE, TRANSFER_ENCODING, CONTENT_RANGE, RESULT_HEADER] {
        doc.headers.remove(name);
    }
    let compress = should_compress(doc, &opts.compressible_types);
    if !doc.range_parts.is_empty() {
        doc.sync_range_parts();
    }
    let by_reference = store.reference().is_some();

    if opts.use_chunking {
        if let (Some(ts), Some(series)) = (ts, doc.timeseries.as_deref()) {
            let mut docs = Vec::new();
            for extent in chunks::timeseries_chunk_extents(&ts.query, opts.timeseries_chunk_factor) {
                let mut chunk = chunks::timeseries_chunk(doc, series, extent);
                if let (false, Some(marshal), Some(series)) = (by_reference, ts.marshal.as_ref(), chunk.timeseries.as_deref()) {
                    chunk.body = marshal(series)?.into();
                }
                docs.push((chunk_key(key, extent), chunk));
            }
            docs.push((key.to_string(), chunks::meta_document(doc)));
            debug!("Writing timeseries chunks: key={}, count={}", key, docs.len());
            return chunks::write_chunks(store, docs, compress, &opts.compression, ttl, opts.write_concurrency).await;
        }

        let parts: RangeParts = if !doc.range_parts.is_empty() {
            doc.range_parts.clone()
        } else if !doc.body.is_empty() {
            std::iter::once(RangePart::new(
                ByteRange::new(0, doc.body.len() as i64 - 1),
                doc.body.clone(),
            ))
            .collect()
        } else {
            RangeParts::new()
        };

        if doc.content_length > 0 && !parts.is_empty() {
            let mut docs: Vec<(String, HttpDocument)> = chunks::chunk_spans_for(&parts.ranges(), opts.byterange_chunk_size)
                .into_iter()
                .map(|span| (chunk_key(key, span), chunks::byterange_chunk(doc, &parts, span)))
                .collect();
            let mut meta = chunks::meta_document(doc);
            if !meta.ranges.is_empty() && !doc.chunk_ranges.is_empty() {
                // chunks read earlier but not loaded into this document still belong to it
                let held: ByteRanges = meta.ranges.iter().chain(doc.chunk_ranges.iter()).copied().collect();
                meta.ranges = held.compress();
            }
            docs.push((key.to_string(), meta));
            debug!("Writing byterange chunks: key={}, count={}", key, docs.len());
            return chunks::write_chunks(store, docs, compress, &opts.compression, ttl, opts.write_concurrency).await;
        }
    }

    let mut whole = doc.clone();
    if let Some(ts) = ts {
        if let (false, Some(marshal), Some(series)) = (by_reference, ts.marshal.as_ref(), doc.timeseries.as_deref()) {
            whole.body = marshal(series)?.into();
        }
    }
    chunks::store_document(store.as_ref(), key, whole, compress, &opts.compression, ttl).await
}

/// Remove a cached document and, when chunking is enabled, its byte-range chunks
pub async fn purge_cache(store: &Arc<dyn CacheStore>, key: &str, opts: &CacheOptions) -> Result<()> {
    if opts.use_chunking {
        if let Ok(Some(meta)) = chunks::fetch_document(store.as_ref(), key).await {
            if meta.is_meta && meta.content_length > 0 {
                let held = if meta.ranges.is_empty() {
                    ByteRanges(vec![ByteRange::new(0, meta.content_length - 1)])
                } else {
                    meta.ranges.clone()
                };
                for span in chunks::chunk_spans_for(&held, opts.byterange_chunk_size) {
                    store.remove(&chunk_key(key, span)).await?;
                }
            }
        }
    }
    store.remove(key).await
}
