//! Cacheable HTTP document

use crate::error::{CacheError, Result};
use crate::headers::{self, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, MULTIPART_BYTERANGES};
use crate::multipart::{parse_multipart_range_response_body, RangePart, RangeParts};
use crate::policy::CachingPolicy;
use crate::ranges::{parse_content_range_header, ByteRanges};
use crate::timeseries::Timeseries;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An origin response as held in cache
///
/// A document either carries the complete object in `body`, or a set of
/// disjoint `range_parts` of it. `stored_range_parts` mirrors the parts in
/// the string-keyed form written by serializing stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpDocument {
    pub status_code: u16,
    pub status: String,
    #[serde(with = "headers::serde_header_map")]
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Full length of the object, -1 when unknown
    pub content_length: i64,
    pub content_type: String,
    pub caching_policy: CachingPolicy,

    pub ranges: ByteRanges,
    #[serde(skip)]
    pub range_parts: RangeParts,
    pub stored_range_parts: BTreeMap<String, RangePart>,
    /// Ranges the chunk store held when this document was assembled from chunks
    #[serde(skip)]
    pub chunk_ranges: ByteRanges,

    /// Manifest of a chunked object; holds no body itself
    pub is_meta: bool,
    pub is_chunk: bool,

    #[serde(skip)]
    pub is_fulfillment: bool,
    #[serde(skip)]
    pub is_loaded: bool,
    #[serde(skip)]
    pub range_parts_loaded: bool,
    #[serde(skip)]
    pub timeseries: Option<Box<dyn Timeseries>>,
}

impl HttpDocument {
    pub fn new(status_code: u16, headers: HeaderMap) -> Self {
        HttpDocument {
            status_code,
            status: status_text(status_code),
            headers,
            content_length: -1,
            ..Default::default()
        }
    }

    /// Replace the body and keep `Content-Length` in step with it
    pub fn set_body(&mut self, body: Bytes) {
        self.content_length = body.len() as i64;
        headers::set_str(&mut self.headers, CONTENT_LENGTH, &body.len().to_string());
        self.body = body;
    }

    /// Whether the document only holds pieces of the object
    pub fn is_partial(&self) -> bool {
        !self.range_parts.is_empty() || !self.ranges.is_empty()
    }

    /// Materialize `range_parts` from the stored form after deserialization
    pub fn load_range_parts(&mut self) {
        if self.range_parts_loaded {
            return;
        }
        if !self.stored_range_parts.is_empty() {
            self.range_parts = RangeParts::from_packable(&self.stored_range_parts);
            self.ranges = self.range_parts.ranges();
        }
        self.range_parts_loaded = true;
    }

    /// Refresh `ranges` and the stored form after `range_parts` changed
    pub fn sync_range_parts(&mut self) {
        self.range_parts.compress();
        self.ranges = self.range_parts.ranges();
        self.stored_range_parts = self.range_parts.packable();
        self.range_parts_loaded = true;
    }

    /// Fold the body of a partial-content response into this document
    ///
    /// Handles a single `Content-Range` part, a `multipart/byteranges` body,
    /// and a plain full body. When the parts end up covering the whole
    /// object the document is fulfilled into a complete 200.
    ///
    /// A body that does not match its `Content-Range` is rejected and leaves
    /// the document unchanged.
    pub fn parse_partial_content_body(&mut self, response_headers: &HeaderMap, body: Bytes) -> Result<()> {
        let ct = headers::get_str(response_headers, CONTENT_TYPE)
            .unwrap_or_default()
            .to_string();
        let is_multipart = ct.starts_with(MULTIPART_BYTERANGES);

        if let Some(cr) = headers::get_str(response_headers, CONTENT_RANGE) {
            let (range, full_length) = parse_content_range_header(cr)
                .map_err(|e| CacheError::UpstreamError(format!("bad Content-Range {}: {}", cr, e)))?;
            let part = RangePart::new(range, body);
            check_part(&part, full_length)?;
            if !is_multipart {
                self.content_type = ct;
            }
            self.content_length = full_length;
            self.range_parts.insert(part);
            self.sync_range_parts();
        } else if is_multipart {
            let (parts, part_type, _, full_length) = parse_multipart_range_response_body(&body, &ct)
                .map_err(|e| CacheError::UpstreamError(format!("unusable multipart range response: {}", e)))?;
            for part in parts.iter() {
                check_part(part, full_length)?;
            }
            self.range_parts.merge(parts);
            self.content_length = full_length;
            if !part_type.is_empty() && !part_type.starts_with(MULTIPART_BYTERANGES) {
                self.content_type = part_type;
            }
            self.sync_range_parts();
        } else {
            self.content_type = ct;
            self.set_body(body);
        }

        if self.content_length > 0 && self.range_parts.len() == 1 {
            let covers_all = self
                .range_parts
                .iter()
                .next()
                .is_some_and(|p| p.range.start == 0 && p.range.end == self.content_length - 1);
            if covers_all {
                // cannot fail: the single part spans the whole object
                let _ = self.fulfill_content_body();
            }
        }

        self.headers.remove(CONTENT_TYPE);
        Ok(())
    }

    /// Collapse the range parts into one complete body
    ///
    /// Only succeeds when the parts cover exactly `[0, content_length-1]`;
    /// otherwise the body is cleared and an error returned.
    pub fn fulfill_content_body(&mut self) -> Result<()> {
        if self.range_parts.is_empty() {
            self.body = Bytes::new();
            return Err(CacheError::ReconstructionError(
                "document has no ranges to fulfill".to_string(),
            ));
        }

        self.range_parts.compress();
        self.ranges = self.range_parts.ranges();

        let complete = match self.range_parts.iter().next() {
            Some(p) if self.range_parts.len() == 1 => {
                p.range.start == 0
                    && p.range.end == self.content_length - 1
                    && p.content.len() as i64 == self.content_length
            }
            _ => false,
        };
        if !complete {
            self.body = Bytes::new();
            return Err(CacheError::ReconstructionError(
                "cached parts do not comprise the full body".to_string(),
            ));
        }

        let content = self
            .range_parts
            .iter()
            .next()
            .map(|p| p.content.clone())
            .unwrap_or_default();

        self.status_code = StatusCode::OK.as_u16();
        self.status = status_text(self.status_code);
        self.ranges = ByteRanges::default();
        self.range_parts = RangeParts::new();
        self.stored_range_parts.clear();
        self.headers.remove(CONTENT_RANGE);
        self.set_body(content);
        Ok(())
    }

    /// Bytes of the object this document accounts for
    ///
    /// For a partial document this counts the held ranges, those still in
    /// chunk storage included, rather than the parts currently loaded.
    pub fn held_length(&self) -> i64 {
        if !self.is_partial() {
            return self.body.len() as i64;
        }
        let held: ByteRanges = self.ranges.iter().chain(self.chunk_ranges.iter()).copied().collect();
        held.compress().iter().filter(|r| !r.is_open()).map(|r| r.size()).sum()
    }

    /// Approximate in-memory size of the document
    pub fn size(&self) -> usize {
        let header_size: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum();
        let parts_size: usize = self.range_parts.iter().map(|p| p.content.len() + 16).sum();
        header_size
            + self.body.len()
            + parts_size
            + std::mem::size_of::<CachingPolicy>()
            + self.timeseries.as_ref().map(|ts| ts.size()).unwrap_or(0)
    }
}

/// A part is usable only when its content fills its range exactly and the
/// range lies inside the object
fn check_part(part: &RangePart, full_length: i64) -> Result<()> {
    if !part.is_complete() {
        return Err(CacheError::UpstreamError(format!(
            "partial content for {} holds {} of {} bytes",
            part.range,
            part.content.len(),
            part.range.size()
        )));
    }
    if full_length >= 0 && part.range.end >= full_length {
        return Err(CacheError::UpstreamError(format!(
            "partial content {} lies outside of content length {}",
            part.range, full_length
        )));
    }
    Ok(())
}

fn status_text(code: u16) -> String {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(|reason| format!("{} {}", code, reason))
        .unwrap_or_else(|| code.to_string())
}

/// Build a document from an origin response
///
/// Partial content is parsed into range parts and fulfilled into a full
/// body when the parts cover the whole object. Partial content whose body
/// does not match its `Content-Range` is an error.
pub fn document_from_response(
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    policy: CachingPolicy,
) -> Result<HttpDocument> {
    let content_length = headers::get_str(&headers, CONTENT_LENGTH)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);
    let ct = headers::get_str(&headers, CONTENT_TYPE)
        .unwrap_or_default()
        .to_string();

    let mut doc = HttpDocument::new(status, headers);
    doc.caching_policy = policy;
    doc.content_length = content_length;
    if !ct.starts_with(MULTIPART_BYTERANGES) {
        doc.content_type = ct;
    }

    if status == StatusCode::PARTIAL_CONTENT.as_u16() && !body.is_empty() {
        let response_headers = doc.headers.clone();
        doc.parse_partial_content_body(&response_headers, body)?;
        let _ = doc.fulfill_content_body();
    } else {
        doc.set_body(body);
    }
    doc.range_parts_loaded = true;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::ByteRange;
    use http::HeaderValue;

    fn partial_headers(cr: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_RANGE, HeaderValue::from_str(cr).unwrap());
        h.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        h
    }

    #[test]
    fn test_set_body_updates_length() {
        let mut doc = HttpDocument::new(200, HeaderMap::new());
        doc.set_body(Bytes::from_static(b"hello"));
        assert_eq!(doc.content_length, 5);
        assert_eq!(headers::get_str(&doc.headers, CONTENT_LENGTH), Some("5"));
    }

    #[test]
    fn test_partial_response_stays_partial() {
        let doc = document_from_response(
            206,
            partial_headers("bytes 0-4/20"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        )
        .unwrap();
        assert_eq!(doc.status_code, 206);
        assert_eq!(doc.content_length, 20);
        assert_eq!(doc.ranges, ByteRanges(vec![ByteRange::new(0, 4)]));
        assert!(doc.body.is_empty());
        assert_eq!(doc.content_type, "text/plain");
        assert!(!doc.headers.contains_key(CONTENT_TYPE));
        assert!(doc.stored_range_parts.contains_key("0-4"));
    }

    #[test]
    fn test_partial_response_covering_everything_is_fulfilled() {
        let doc = document_from_response(
            206,
            partial_headers("bytes 0-4/5"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        )
        .unwrap();
        assert_eq!(doc.status_code, 200);
        assert_eq!(doc.body.as_ref(), b"01234");
        assert!(doc.ranges.is_empty());
        assert!(doc.range_parts.is_empty());
    }

    #[test]
    fn test_fulfill_incomplete_clears_body() {
        let mut doc = HttpDocument::new(206, HeaderMap::new());
        doc.content_length = 10;
        doc.body = Bytes::from_static(b"stale");
        doc.range_parts.insert(RangePart::new(ByteRange::new(0, 4), Bytes::from_static(b"01234")));
        doc.range_parts.insert(RangePart::new(ByteRange::new(6, 9), Bytes::from_static(b"6789")));
        assert!(doc.fulfill_content_body().is_err());
        assert!(doc.body.is_empty());

        doc.range_parts.insert(RangePart::new(ByteRange::new(5, 5), Bytes::from_static(b"5")));
        doc.fulfill_content_body().unwrap();
        assert_eq!(doc.body.as_ref(), b"0123456789");
        assert_eq!(doc.status_code, 200);
    }

    #[test]
    fn test_merge_second_partial_body() {
        let mut doc = document_from_response(
            206,
            partial_headers("bytes 0-4/10"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        )
        .unwrap();
        doc.parse_partial_content_body(&partial_headers("bytes 5-9/10"), Bytes::from_static(b"56789"))
            .unwrap();
        assert_eq!(doc.status_code, 200);
        assert_eq!(doc.body.as_ref(), b"0123456789");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut doc = document_from_response(
            206,
            partial_headers("bytes 2-4/10"),
            Bytes::from_static(b"234"),
            CachingPolicy {
                freshness_lifetime: 60,
                etag: "\"v1\"".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        doc.headers.insert("x-origin", HeaderValue::from_static("a"));

        let encoded = bincode::serialize(&doc).unwrap();
        let mut decoded: HttpDocument = bincode::deserialize(&encoded).unwrap();
        assert!(decoded.range_parts.is_empty());
        decoded.load_range_parts();

        assert_eq!(decoded.status_code, doc.status_code);
        assert_eq!(decoded.headers, doc.headers);
        assert_eq!(decoded.content_length, 10);
        assert_eq!(decoded.ranges, doc.ranges);
        assert_eq!(decoded.range_parts, doc.range_parts);
        assert_eq!(decoded.caching_policy, doc.caching_policy);
    }

    #[test]
    fn test_truncated_partial_body_is_rejected() {
        let result = document_from_response(
            206,
            partial_headers("bytes 0-9/20"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        );
        assert!(matches!(result, Err(CacheError::UpstreamError(_))));

        let mut doc = document_from_response(
            206,
            partial_headers("bytes 0-4/20"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        )
        .unwrap();
        assert!(doc
            .parse_partial_content_body(&partial_headers("bytes 5-9/20"), Bytes::from_static(b"567"))
            .is_err());
        assert_eq!(doc.ranges, ByteRanges(vec![ByteRange::new(0, 4)]));
        assert_eq!(doc.range_parts.iter().next().unwrap().content.as_ref(), b"01234");
    }

    #[test]
    fn test_partial_range_past_content_length_is_rejected() {
        let result = document_from_response(
            206,
            partial_headers("bytes 5-9/8"),
            Bytes::from_static(b"56789"),
            CachingPolicy::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_held_length_counts_chunk_ranges() {
        let mut doc = document_from_response(
            206,
            partial_headers("bytes 0-4/100"),
            Bytes::from_static(b"01234"),
            CachingPolicy::default(),
        )
        .unwrap();
        assert_eq!(doc.held_length(), 5);
        doc.chunk_ranges = ByteRanges(vec![ByteRange::new(0, 4), ByteRange::new(50, 59)]);
        assert_eq!(doc.held_length(), 15);
    }
}
