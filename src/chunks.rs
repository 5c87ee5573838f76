//! Chunk fan-out for large cached objects
//!
//! A chunked object is stored as one meta document under the cache key plus
//! one document per fixed-size chunk under `key.<range>` (byte ranges) or
//! `key.<extent>` (time series). Reads and writes run one task per chunk,
//! bounded by a semaphore.

use crate::codec::{decode_document, encode_document, CompressionConfig};
use crate::document::HttpDocument;
use crate::error::{CacheError, Result};
use crate::multipart::{RangePart, RangeParts};
use crate::ranges::{ByteRange, ByteRanges};
use crate::status::LookupStatus;
use crate::storage::CacheStore;
use crate::timeseries::{Extent, TimeRangeQuery, Timeseries, UnmarshalerFn};
use bytes::Bytes;
use http::HeaderMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Storage key of one chunk
pub fn chunk_key(key: &str, span: impl Display) -> String {
    format!("{}.{}", key, span)
}

/// Chunk-aligned ranges covering `first..=last`
pub fn byterange_chunk_spans(first: i64, last: i64, size: i64) -> Vec<ByteRange> {
    if size <= 0 || last < first {
        return Vec::new();
    }
    let start = first.max(0).div_euclid(size) * size;
    let end = (last.div_euclid(size) + 1) * size;
    (0..)
        .map(|i| start + i * size)
        .take_while(|s| *s < end)
        .map(|s| ByteRange::new(s, s + size - 1))
        .collect()
}

/// Distinct chunk-aligned ranges touching any of `ranges`
///
/// Gaps between the ranges get no chunks, so the count follows the bytes
/// held rather than the distance between the first and last byte.
pub fn chunk_spans_for(ranges: &ByteRanges, size: i64) -> Vec<ByteRange> {
    let mut spans: Vec<ByteRange> = ranges
        .iter()
        .filter(|r| !r.is_open())
        .flat_map(|r| byterange_chunk_spans(r.start, r.end, size))
        .collect();
    spans.sort();
    spans.dedup();
    spans
}

/// Parts of the object a chunked read has to assemble
///
/// The wanted ranges (the whole object when none) are clipped to the object
/// and to the ranges the meta document says are held.
fn chunk_regions(wanted: &ByteRanges, held: &ByteRanges, full_length: i64) -> ByteRanges {
    let whole = ByteRange::new(0, full_length - 1);
    let wants: Vec<ByteRange> = if wanted.is_empty() {
        vec![whole]
    } else {
        wanted
            .resolve(full_length)
            .iter()
            .filter(|r| !r.is_open())
            .map(|r| ByteRange::new(r.start.max(0), r.end.min(whole.end)))
            .collect()
    };
    let held: Vec<ByteRange> = if held.is_empty() {
        vec![whole]
    } else {
        held.compress().iter().filter(|r| !r.is_open()).copied().collect()
    };

    let mut out = Vec::new();
    for w in &wants {
        for h in &held {
            let lo = w.start.max(h.start);
            let hi = w.end.min(h.end);
            if lo <= hi {
                out.push(ByteRange::new(lo, hi));
            }
        }
    }
    ByteRanges(out).compress()
}

/// Chunk-aligned extents covering a time-series query
///
/// Chunks span `step * factor` milliseconds; the last timestamp of a chunk
/// is one step before the next chunk starts.
pub fn timeseries_chunk_extents(query: &TimeRangeQuery, factor: i64) -> Vec<Extent> {
    let step = query.step_ms;
    let csize = step * factor;
    if csize <= 0 {
        return Vec::new();
    }
    let start = query.extent.start.div_euclid(csize) * csize;
    let end = query.extent.end.div_euclid(csize) * csize + csize;
    (0..)
        .map(|i| start + i * csize)
        .take_while(|s| *s < end)
        .map(|s| Extent::new(s, s + csize - step))
        .collect()
}

/// The manifest stored under the object key: head and policy, no content
pub fn meta_document(doc: &HttpDocument) -> HttpDocument {
    HttpDocument {
        status_code: doc.status_code,
        status: doc.status.clone(),
        headers: doc.headers.clone(),
        content_length: doc.content_length,
        content_type: doc.content_type.clone(),
        caching_policy: doc.caching_policy.clone(),
        ranges: doc.ranges.clone(),
        is_meta: true,
        ..Default::default()
    }
}

fn chunk_document(doc: &HttpDocument) -> HttpDocument {
    HttpDocument {
        status_code: doc.status_code,
        status: doc.status.clone(),
        headers: HeaderMap::new(),
        content_length: doc.content_length,
        content_type: doc.content_type.clone(),
        is_chunk: true,
        ..Default::default()
    }
}

/// Cut the slice of `parts` that falls inside `chunk` into a chunk document
///
/// The chunk body is indexed from the chunk start; `ranges` lists the
/// absolute ranges it actually holds.
pub fn byterange_chunk(doc: &HttpDocument, parts: &RangeParts, chunk: ByteRange) -> HttpDocument {
    let mut out = chunk_document(doc);
    let mut body = vec![0u8; chunk.size().max(0) as usize];
    let mut high = 0usize;
    let mut held = Vec::new();

    for part in parts.iter() {
        let lo = part.range.start.max(chunk.start);
        let hi = part.range.end.min(chunk.end);
        if lo > hi {
            continue;
        }
        let from = (lo - part.range.start) as usize;
        let to = (hi - part.range.start + 1) as usize;
        let Some(content) = part.content.get(from..to) else {
            continue;
        };
        let relative = ByteRange::new(lo - chunk.start, hi - chunk.start);
        relative.copy_into(&mut body, content);
        high = high.max((relative.end + 1) as usize);
        held.push(ByteRange::new(lo, hi));
    }

    body.truncate(high);
    out.body = Bytes::from(body);
    out.ranges = ByteRanges(held);
    out
}

/// A time-series chunk holding the points of `extent`
pub fn timeseries_chunk(doc: &HttpDocument, series: &dyn Timeseries, extent: Extent) -> HttpDocument {
    let mut out = chunk_document(doc);
    let mut chunk = series.clone_box();
    chunk.crop_to_range(extent);
    out.timeseries = Some(chunk);
    out
}

/// Fetch one document, by reference when the store allows it
///
/// A missing key or a non-hit lookup is `Ok(None)`.
pub async fn fetch_document(store: &dyn CacheStore, key: &str) -> Result<Option<HttpDocument>> {
    let fetched = match store.reference() {
        Some(refs) => refs
            .retrieve_reference(key)
            .await
            .map(|(doc, status)| (HttpDocument::clone(&doc), status)),
        None => match store.retrieve(key).await {
            Ok((data, status)) => decode_document(&data).map(|doc| (doc, status)),
            Err(e) => Err(e),
        },
    };

    match fetched {
        Ok((mut doc, LookupStatus::Hit)) => {
            doc.load_range_parts();
            doc.is_loaded = true;
            Ok(Some(doc))
        }
        Ok(_) => Ok(None),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Store one document, by reference when the store allows it
pub async fn store_document(
    store: &dyn CacheStore,
    key: &str,
    mut doc: HttpDocument,
    compress: bool,
    compression: &CompressionConfig,
    ttl: Duration,
) -> Result<()> {
    match store.reference() {
        Some(refs) => {
            // a reader gets these back the same way it would from bytes
            doc.range_parts = RangeParts::new();
            doc.range_parts_loaded = false;
            doc.is_fulfillment = false;
            doc.is_loaded = false;
            doc.caching_policy.reset_client_conditionals();
            refs.store_reference(key, Arc::new(doc), ttl).await
        }
        None => {
            let data = encode_document(&doc, compress, compression)?;
            store.store(key, data, ttl).await
        }
    }
}

/// Read many chunk documents concurrently
///
/// Results come back in key order, `None` where a chunk is missing. The first
/// hard error aborts every chunk read still in flight and is returned.
pub async fn read_chunks(
    store: &Arc<dyn CacheStore>,
    keys: Vec<String>,
    limit: usize,
) -> Result<Vec<Option<HttpDocument>>> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let count = keys.len();

    for (index, key) in keys.into_iter().enumerate() {
        let store = store.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => fetch_document(store.as_ref(), &key).await,
                Err(e) => Err(CacheError::InternalError(e.to_string())),
            };
            (index, key, result)
        });
    }

    let mut out: Vec<Option<HttpDocument>> = vec![None; count];
    while let Some(joined) = tasks.join_next().await {
        let (index, key, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                tasks.abort_all();
                return Err(CacheError::InternalError(format!("chunk read task failed: {}", e)));
            }
        };
        match result {
            Ok(doc) => out[index] = doc,
            Err(e) => {
                error!("Chunk query failed: key={}, chunk_idx={}, error={}", key, index, e);
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    Ok(out)
}

/// Write many documents concurrently, aggregating every failure
pub async fn write_chunks(
    store: &Arc<dyn CacheStore>,
    docs: Vec<(String, HttpDocument)>,
    compress: bool,
    compression: &CompressionConfig,
    ttl: Duration,
    limit: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let count = docs.len();

    for (key, doc) in docs {
        let store = store.clone();
        let semaphore = semaphore.clone();
        let compression = compression.clone();
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => store_document(store.as_ref(), &key, doc, compress, &compression, ttl).await,
                Err(e) => Err(CacheError::InternalError(e.to_string())),
            };
            result.map_err(|e| {
                error!("Chunk write failed: key={}, error={}", key, e);
                e
            })
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(CacheError::InternalError(format!("chunk write task failed: {}", e))),
        }
    }
    debug!("Wrote {} chunk documents, {} failed", count, errors.len());
    CacheError::from_many(errors)
}

/// Reassemble a byte-range object from its chunks
///
/// Fills `doc` (a meta document) with the content of every chunk touching
/// `wanted`, limited to the ranges the meta document holds. Each region to
/// assemble gets its own buffer sized to the region, and chunk content is
/// copied in at its offset. Returns the ranges actually found; an empty
/// result means no chunk was present.
pub async fn read_byterange_chunks(
    store: &Arc<dyn CacheStore>,
    key: &str,
    doc: &mut HttpDocument,
    wanted: &ByteRanges,
    size: i64,
    limit: usize,
) -> Result<ByteRanges> {
    let full_length = doc.content_length;
    if full_length <= 0 || size <= 0 {
        return Ok(ByteRanges::default());
    }

    let held = doc.ranges.clone();
    let spans = chunk_spans_for(&chunk_regions(wanted, &held, full_length), size);
    let regions = chunk_regions(&ByteRanges(spans.clone()), &held, full_length);
    let keys = spans.iter().map(|r| chunk_key(key, r)).collect();
    let chunks: Vec<HttpDocument> = read_chunks(store, keys, limit)
        .await?
        .into_iter()
        .flatten()
        .filter(|c| !c.is_meta)
        .collect();

    let mut parts = RangeParts::new();
    for region in regions.iter() {
        let mut buf = vec![0u8; region.size() as usize];
        let mut filled = Vec::new();
        for chunk in &chunks {
            for r in chunk.ranges.iter() {
                let lo = r.start.max(region.start);
                let hi = r.end.min(region.end);
                if lo > hi {
                    continue;
                }
                let from = lo.rem_euclid(size) as usize;
                let to = hi.rem_euclid(size) as usize + 1;
                if let Some(content) = chunk.body.get(from..to) {
                    ByteRange::new(lo - region.start, hi - region.start).copy_into(&mut buf, content);
                    filled.push(ByteRange::new(lo, hi));
                }
            }
        }
        let buf = Bytes::from(buf);
        for r in ByteRanges(filled).compress().iter() {
            let from = (r.start - region.start) as usize;
            let to = (r.end - region.start + 1) as usize;
            parts.insert(RangePart::new(*r, buf.slice(from..to)));
        }
    }

    let filled = parts.ranges();
    doc.is_meta = false;
    doc.body = Bytes::new();
    doc.range_parts = parts;
    doc.sync_range_parts();
    doc.chunk_ranges = if held.is_empty() {
        ByteRanges(vec![ByteRange::new(0, full_length - 1)])
    } else {
        held
    };

    if filled.len() == 1 && filled[0] == ByteRange::new(0, full_length - 1) {
        doc.fulfill_content_body()?;
    }
    Ok(filled)
}

/// Reassemble a time series from its chunks; returns false when none was found
pub async fn read_timeseries_chunks(
    store: &Arc<dyn CacheStore>,
    key: &str,
    doc: &mut HttpDocument,
    query: &TimeRangeQuery,
    unmarshal: Option<&UnmarshalerFn>,
    factor: i64,
    limit: usize,
) -> Result<bool> {
    let extents = timeseries_chunk_extents(query, factor);
    let keys = extents.iter().map(|e| chunk_key(key, e)).collect();
    let chunks = read_chunks(store, keys, limit).await?;
    let by_reference = store.reference().is_some();

    let mut merged: Option<Box<dyn Timeseries>> = None;
    for (index, chunk) in chunks.into_iter().enumerate() {
        let Some(chunk) = chunk else { continue };
        let series = match (by_reference, unmarshal) {
            (true, _) => chunk.timeseries,
            (false, Some(unmarshal)) => match unmarshal(&chunk.body, Some(query)) {
                Ok(series) => Some(series),
                Err(e) => {
                    error!("Chunk unmarshal failed: key={}, chunk_idx={}, error={}", key, index, e);
                    return Err(e);
                }
            },
            (false, None) => None,
        };
        match (merged.as_mut(), series) {
            (Some(m), Some(s)) => m.merge(s.as_ref()),
            (None, Some(s)) => merged = Some(s),
            _ => {}
        }
    }

    if let Some(series) = merged.as_mut() {
        let extents = series.extents().compress(query.step_ms);
        series.set_extents(extents);
    }
    doc.is_meta = false;
    let found = merged.is_some();
    doc.timeseries = merged;
    Ok(found)
}
